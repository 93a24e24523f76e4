//! ATT link session for the personalization characteristics.
//!
//! One background reader splits the inbound PDU stream: handle-value
//! notifications fan out to per-handle listeners, everything else is queued
//! as the response to the request in flight. Requests are serialized, the
//! protocol has no transaction ids to correlate by.
//!
//! Writes to a characteristic are gated on one successful read of it first.
//! After a reconnect the device answers reads with truncated blobs until its
//! settings store is warm; writing a locally fabricated blob in that window
//! can wipe the on-device tuning.

use std::{
   collections::{HashMap, HashSet},
   panic::{AssertUnwindSafe, catch_unwind},
   sync::{
      Arc,
      atomic::{AtomicU64, Ordering},
   },
};

use bluer::Address;
use log::{debug, info, warn};
use tokio::{
   sync::{Mutex, mpsc},
   task::JoinSet,
   time,
};

use crate::{
   bluetooth::l2cap::{self, L2CapReceiver, L2CapSender, Packet, PSM_ATT},
   config::Config,
   error::{Error, Result},
   gatt::{
      att::{self, AttHandle},
      personalization::{HearingAidSettings, TransparencySettings},
   },
};

/// Opaque handle to a registered notification listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttListenerToken(u64);

type NotificationListener = Arc<dyn Fn(&[u8]) + Send + Sync>;

#[derive(Default)]
struct Listeners {
   next_token: AtomicU64,
   map: parking_lot::Mutex<HashMap<u16, Vec<(AttListenerToken, NotificationListener)>>>,
}

impl Listeners {
   fn register(&self, handle: u16, listener: NotificationListener) -> AttListenerToken {
      let token = AttListenerToken(self.next_token.fetch_add(1, Ordering::Relaxed));
      self.map.lock().entry(handle).or_default().push((token, listener));
      token
   }

   fn unregister(&self, token: AttListenerToken) {
      let mut map = self.map.lock();
      for entries in map.values_mut() {
         entries.retain(|(t, _)| *t != token);
      }
   }

   fn dispatch(&self, handle: u16, value: &[u8]) {
      let matching: Vec<NotificationListener> = {
         let map = self.map.lock();
         match map.get(&handle) {
            Some(entries) => entries.iter().map(|(_, l)| l.clone()).collect(),
            None => return,
         }
      };
      for listener in matching {
         if catch_unwind(AssertUnwindSafe(|| listener(value))).is_err() {
            warn!("Notification listener for handle {handle:#06x} panicked");
         }
      }
   }
}

struct AttInner {
   address: Address,
   config: Config,
   sender: L2CapSender,
   listeners: Arc<Listeners>,
   responses: Mutex<mpsc::Receiver<Packet>>,
   read_ok: parking_lot::Mutex<HashSet<AttHandle>>,
   last_read: parking_lot::Mutex<HashMap<AttHandle, Vec<u8>>>,
   // aborts the reader on drop
   _jset: JoinSet<()>,
}

/// Session on the vendor ATT channel.
///
/// Cheaply cloneable; requests from concurrent callers are serialized.
#[derive(Clone)]
pub struct AttSession(Arc<AttInner>);

impl std::fmt::Debug for AttSession {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("AttSession")
         .field("address", &self.0.address)
         .field("connected", &self.is_connected())
         .finish()
   }
}

impl AttSession {
   /// Opens the ATT channel to `address`.
   pub async fn connect(address: Address, config: Config) -> Result<Self> {
      info!("Connecting to ATT channel of {address}");
      let mut jset = JoinSet::new();
      let params = l2cap::LinkParams {
         psm: PSM_ATT,
         connect_timeout: config.connect_timeout(),
         write_timeout: config.write_timeout(),
      };
      let (receiver, sender) =
         l2cap::connect(&mut jset, l2cap::Hooks::new(), address, params).await?;
      Ok(Self::attach(address, config, receiver, sender, jset))
   }

   fn attach(
      address: Address,
      config: Config,
      receiver: L2CapReceiver,
      sender: L2CapSender,
      mut jset: JoinSet<()>,
   ) -> Self {
      let listeners = Arc::new(Listeners::default());
      let (resp_tx, resp_rx) = mpsc::channel(32);
      jset.spawn(reader_task(address, receiver, listeners.clone(), resp_tx));

      Self(Arc::new(AttInner {
         address,
         config,
         sender,
         listeners,
         responses: Mutex::new(resp_rx),
         read_ok: parking_lot::Mutex::new(HashSet::new()),
         last_read: parking_lot::Mutex::new(HashMap::new()),
         _jset: jset,
      }))
   }

   pub fn address(&self) -> Address {
      self.0.address
   }

   pub fn is_connected(&self) -> bool {
      self.0.sender.is_connected()
   }

   /// Whether `handle` has been read successfully since connecting.
   pub fn read_succeeded(&self, handle: AttHandle) -> bool {
      self.0.read_ok.lock().contains(&handle)
   }

   pub fn register_listener<F>(&self, handle: AttHandle, listener: F) -> AttListenerToken
   where
      F: Fn(&[u8]) + Send + Sync + 'static,
   {
      self.0.listeners.register(handle.handle(), Arc::new(listener))
   }

   pub fn unregister_listener(&self, token: AttListenerToken) {
      self.0.listeners.unregister(token);
   }

   /// Sends one request PDU and waits for the matching response.
   async fn request(&self, pdu: &[u8]) -> Result<Packet> {
      let mut responses = self.0.responses.lock().await;
      // drop responses orphaned by earlier timeouts
      while responses.try_recv().is_ok() {}

      self.0.sender.send(pdu).await?;
      match time::timeout(self.0.config.att_response_timeout(), responses.recv()).await {
         Ok(Some(resp)) => Ok(resp),
         Ok(None) => Err(Error::ConnectionClosed),
         Err(_) => Err(Error::RequestTimeout),
      }
   }

   /// Reads the current value of `handle`.
   pub async fn read(&self, handle: AttHandle) -> Result<Packet> {
      let resp = self.request(&att::encode_read(handle.handle())).await?;
      match resp.split_first() {
         Some((opcode, value)) => {
            if *opcode != att::pdu::READ_RESPONSE {
               debug!(
                  "{}: read of {handle} answered with opcode {opcode:#04x}",
                  self.0.address
               );
            }
            Ok(Packet::from_slice(value))
         },
         None => Err(Error::ConnectionClosed),
      }
   }

   async fn write_raw(&self, handle: u16, value: &[u8]) -> Result<()> {
      match self.request(&att::encode_write(handle, value)).await {
         Ok(_) => Ok(()),
         Err(Error::RequestTimeout) => {
            warn!("{}: no write response for {handle:#06x}", self.0.address);
            Ok(())
         },
         Err(e) => Err(e),
      }
   }

   /// Writes to a characteristic, refusing until a read of it succeeded.
   pub async fn write(&self, handle: AttHandle, value: &[u8]) -> Result<()> {
      if !self.read_succeeded(handle) {
         warn!(
            "{}: suppressing write to {handle}, it has not been read yet",
            self.0.address
         );
         return Err(Error::SettingsNotSynced);
      }
      self.write_raw(handle.handle(), value).await
   }

   /// Subscribes to notifications for `handle` by writing its CCCD. Not
   /// gated on the read latch, the CCCD is not part of the settings store.
   pub async fn enable_notifications(&self, handle: AttHandle) -> Result<()> {
      self.write_raw(handle.cccd(), att::CCCD_ENABLE).await
   }

   /// Reads `handle` until `parse` accepts the blob, spacing attempts by the
   /// configured gap. A success opens the write latch for the handle and
   /// caches the raw blob for later patch-writes.
   pub async fn read_with_retry<T>(
      &self,
      handle: AttHandle,
      parse: impl Fn(&[u8]) -> Option<T>,
   ) -> Result<T> {
      let attempts = self.0.config.att_read_attempts.max(1);
      for attempt in 1..=attempts {
         match self.read(handle).await {
            Ok(value) => {
               if let Some(parsed) = parse(&value) {
                  self.0.read_ok.lock().insert(handle);
                  self.0.last_read.lock().insert(handle, value.to_vec());
                  return Ok(parsed);
               }
               debug!(
                  "{handle}: attempt {attempt} returned {} bytes, not a full blob yet",
                  value.len()
               );
            },
            Err(e) => warn!("{handle}: read attempt {attempt} failed: {e}"),
         }
         if attempt != attempts {
            time::sleep(self.0.config.att_read_gap()).await;
         }
      }
      Err(Error::AttributeReadExhausted { attempts })
   }

   pub async fn read_transparency(&self) -> Result<TransparencySettings> {
      self
         .read_with_retry(AttHandle::Transparency, TransparencySettings::unpack)
         .await
   }

   pub async fn write_transparency(&self, settings: &TransparencySettings) -> Result<()> {
      self.write(AttHandle::Transparency, &settings.pack()).await
   }

   pub async fn read_hearing_aid(&self) -> Result<HearingAidSettings> {
      self
         .read_with_retry(AttHandle::HearingAid, HearingAidSettings::unpack)
         .await
   }

   /// Writes hearing-aid settings by patching them into the last blob the
   /// device sent, keeping the opaque header fields intact.
   pub async fn write_hearing_aid(&self, settings: &HearingAidSettings) -> Result<()> {
      let mut blob = self
         .0
         .last_read
         .lock()
         .get(&AttHandle::HearingAid)
         .cloned()
         .ok_or(Error::SettingsNotSynced)?;
      if !settings.patch_into_blob(&mut blob) {
         return Err(Error::SettingsNotSynced);
      }
      self.write(AttHandle::HearingAid, &blob).await
   }
}

async fn reader_task(
   address: Address,
   mut rx: L2CapReceiver,
   listeners: Arc<Listeners>,
   resp_tx: mpsc::Sender<Packet>,
) {
   loop {
      match rx.recv().await {
         Ok(pdu) => {
            if let Some((handle, value)) = att::decode_notification(&pdu) {
               debug!("{address}: notification for {handle:#06x}: {}", hex::encode(value));
               listeners.dispatch(handle, value);
            } else if resp_tx.send(pdu).await.is_err() {
               return;
            }
         },
         Err(e) => {
            warn!("{address}: ATT channel closed: {e:?}");
            return;
         },
      }
   }
}
