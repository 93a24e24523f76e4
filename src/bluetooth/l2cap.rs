//! L2CAP socket plumbing shared by the AACP and ATT links.
//!
//! Each connection is split into a receiver half and a cheaply cloneable
//! sender half. A dedicated writer task serializes outbound packets so that
//! concurrent callers never interleave partial writes on the same socket.

use std::{sync::Arc, time::Duration};

use bluer::{
   Address, AddressType,
   l2cap::{SeqPacket, Socket, SocketAddr},
};
use log::{debug, warn};
use smallvec::SmallVec;
use tokio::{
   sync::{mpsc, oneshot},
   task::JoinSet,
   time,
};

use crate::error::{Error, Result};

pub type Packet = SmallVec<[u8; 32]>;

/// PSM of the accessory control channel.
pub const PSM_AACP: u16 = 0x1001;
/// PSM of the ATT channel carrying the vendor GATT characteristics.
pub const PSM_ATT: u16 = 0x001F;

/// Maximum transmission unit for L2CAP packets.
const L2CAP_MTU: usize = 672;

enum Command {
   Send {
      data: Packet,
      then: oneshot::Sender<Result<()>>,
   },
}

/// Receiver half of an L2CAP connection.
#[derive(Debug)]
pub struct L2CapReceiver {
   rx: mpsc::Receiver<Result<Packet>>,
}

impl L2CapReceiver {
   pub async fn recv(&mut self) -> Result<Packet> {
      self.rx.recv().await.ok_or(Error::ConnectionClosed)?
   }
}

/// Sender half of an L2CAP connection.
///
/// This type is cheaply cloneable; sends are serialized by the writer task.
#[derive(Debug, Clone)]
pub struct L2CapSender {
   tx: mpsc::Sender<Command>,
   write_timeout: Duration,
}

impl L2CapSender {
   pub fn is_connected(&self) -> bool {
      !self.tx.is_closed()
   }

   pub async fn send(&self, data: &[u8]) -> Result<()> {
      if !self.is_connected() {
         return Err(Error::ConnectionClosed);
      }

      let (tx, rx) = oneshot::channel();
      self
         .tx
         .send(Command::Send {
            data: Packet::from_slice(data),
            then: tx,
         })
         .await
         .map_err(|_| Error::ConnectionClosed)?;

      time::timeout(self.write_timeout, rx)
         .await
         .map_err(|_| Error::RequestTimeout)?
         .map_err(|_| Error::ConnectionClosed)?
   }
}

#[derive(Debug, Clone, Copy)]
pub enum HookDisposition {
   Discard,
   Retain,
}

/// One-shot and persistent taps on the inbound packet stream, matched by
/// prefix. Used by the AACP session to observe handshake acknowledgements
/// without consuming them from the main receive path.
pub struct Hooks {
   hooks: Vec<Hook>,
}

impl Hooks {
   pub const fn new() -> Self {
      Self { hooks: Vec::new() }
   }

   pub fn install(mut self, hook: Hook) -> Self {
      self.hooks.push(hook);
      self
   }

   pub fn prefix_once<F>(self, pfx: &[u8], cb: F) -> Self
   where
      F: FnOnce(&[u8]) + Send + 'static,
   {
      self.install(Hook::once(cb).prefix(pfx))
   }

   pub fn passthrough(&mut self, bytes: &Packet) {
      self
         .hooks
         .retain_mut(|hook| matches!(hook.passthrough(bytes), HookDisposition::Retain));
   }
}

impl Default for Hooks {
   fn default() -> Self {
      Self::new()
   }
}

pub type Callback = Box<dyn FnMut(&[u8]) + Send>;

pub struct Hook {
   pfx: heapless::Vec<u8, 8>,
   cb: Callback,
   disposition: HookDisposition,
}

impl Hook {
   pub fn once<F>(cb: F) -> Self
   where
      F: FnOnce(&[u8]) + Send + 'static,
   {
      let mut cb = Some(cb);
      Self {
         pfx: Default::default(),
         cb: Box::new(move |bytes| {
            if let Some(cb) = cb.take() {
               cb(bytes);
            }
         }),
         disposition: HookDisposition::Discard,
      }
   }

   pub fn prefix(mut self, pfx: &[u8]) -> Self {
      self.pfx = heapless::Vec::from_slice(pfx).unwrap();
      self
   }

   pub fn passthrough(&mut self, bytes: &[u8]) -> HookDisposition {
      if bytes.starts_with(&self.pfx) {
         (self.cb)(bytes);
         self.disposition
      } else {
         HookDisposition::Retain
      }
   }
}

/// Connection parameters, sourced from [`crate::config::Config`].
#[derive(Debug, Clone, Copy)]
pub struct LinkParams {
   pub psm: u16,
   pub connect_timeout: Duration,
   pub write_timeout: Duration,
}

pub async fn connect(
   jset: &mut JoinSet<()>,
   hooks: Hooks,
   address: Address,
   params: LinkParams,
) -> Result<(L2CapReceiver, L2CapSender)> {
   debug!("Creating L2CAP socket for {address}");

   let socket = Socket::new_seq_packet()?;
   let addr = SocketAddr::new(address, AddressType::BrEdr, params.psm);
   debug!("Connecting to {address}:{:#06x}", params.psm);

   let seq_packet = time::timeout(params.connect_timeout, socket.connect(addr))
      .await
      .map_err(|_| Error::RequestTimeout)??;

   let (cmd_tx, cmd_rx) = mpsc::channel(128);
   let (in_tx, in_rx) = mpsc::channel(128);

   let seq_packet = Arc::new(seq_packet);
   jset.spawn(recv_task(address, in_tx, seq_packet.clone(), hooks));
   jset.spawn(send_task(address, cmd_rx, seq_packet));

   Ok((L2CapReceiver { rx: in_rx }, L2CapSender {
      tx: cmd_tx,
      write_timeout: params.write_timeout,
   }))
}

async fn recv_task(
   adr: Address,
   tx: mpsc::Sender<Result<Packet>>,
   sp: Arc<SeqPacket>,
   mut hooks: Hooks,
) {
   let mut stack = [0u8; L2CAP_MTU];
   while let Ok(n) = sp.recv(&mut stack).await {
      if n == 0 {
         warn!("Connection lost");
         let _ = tx.send(Err(Error::ConnectionLost)).await;
         return;
      }
      let recvd = &stack[..n];
      debug!("← {adr}: {}", hex::encode(recvd));
      let bytes = Packet::from_slice(recvd);
      hooks.passthrough(&bytes);
      if let Err(e) = tx.send(Ok(bytes)).await {
         warn!("Failed to forward data: {e:?}");
         return;
      }
      stack[..n].fill(0);
   }
}

async fn send_task(adr: Address, mut rx: mpsc::Receiver<Command>, sp: Arc<SeqPacket>) {
   while let Some(cmd) = rx.recv().await {
      match cmd {
         Command::Send { data, then } => {
            debug!("→ {adr}: {}", hex::encode(&data));
            if let Err(e) = sp.send(&data).await {
               warn!("Failed to send data: {e}");
               let _ = then.send(Err(Error::Io(e)));
            } else {
               _ = then.send(Ok(()));
            }
         },
      }
   }
   warn!("User shutdown");
}

/// In-process stand-in for a connected socket. The returned injector feeds
/// the receiver half and the outbound channel observes everything sent, with
/// writes acknowledged immediately.
#[cfg(test)]
pub(crate) fn loopback(
   jset: &mut JoinSet<()>,
) -> (
   L2CapReceiver,
   L2CapSender,
   mpsc::Sender<Result<Packet>>,
   mpsc::Receiver<Packet>,
) {
   let (cmd_tx, mut cmd_rx) = mpsc::channel(128);
   let (in_tx, in_rx) = mpsc::channel(128);
   let (out_tx, out_rx) = mpsc::channel::<Packet>(128);

   jset.spawn(async move {
      while let Some(Command::Send { data, then }) = cmd_rx.recv().await {
         let _ = then.send(Ok(()));
         if out_tx.send(data).await.is_err() {
            return;
         }
      }
   });

   (
      L2CapReceiver { rx: in_rx },
      L2CapSender {
         tx: cmd_tx,
         write_timeout: Duration::from_secs(1),
      },
      in_tx,
      out_rx,
   )
}

#[cfg(test)]
mod tests {
   use super::*;

   #[tokio::test]
   async fn loopback_round_trip() {
      let mut jset = JoinSet::new();
      let (mut receiver, sender, in_tx, mut out_rx) = loopback(&mut jset);

      sender.send(&[0x01, 0x02]).await.unwrap();
      assert_eq!(out_rx.recv().await.unwrap().as_slice(), &[0x01, 0x02]);

      in_tx
         .send(Ok(Packet::from_slice(&[0xAA])))
         .await
         .unwrap();
      assert_eq!(receiver.recv().await.unwrap().as_slice(), &[0xAA]);
   }

   #[tokio::test]
   async fn closed_link_reports_connection_closed() {
      let mut jset = JoinSet::new();
      let (mut receiver, sender, in_tx, _out_rx) = loopback(&mut jset);
      drop(in_tx);
      assert!(matches!(
         receiver.recv().await,
         Err(Error::ConnectionClosed)
      ));
      assert!(sender.is_connected());
   }

   #[test]
   fn hooks_fire_once_per_prefix() {
      let seen = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
      let counter = seen.clone();
      let mut hooks = Hooks::new().prefix_once(&[0x01, 0x00], move |_| {
         counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
      });

      hooks.passthrough(&Packet::from_slice(&[0x02, 0x00]));
      assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 0);

      hooks.passthrough(&Packet::from_slice(&[0x01, 0x00, 0x04]));
      hooks.passthrough(&Packet::from_slice(&[0x01, 0x00, 0x04]));
      assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 1);
   }
}
