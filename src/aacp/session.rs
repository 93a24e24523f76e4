//! Accessory control session and state management.
//!
//! This module provides the core [`AacpSession`] type which represents a
//! connected device, manages its typed state snapshots, and handles
//! communication over the control L2CAP channel.

use core::fmt;
use std::{
   future::Future,
   sync::{Arc, Weak},
};

use bluer::Address;
use crossbeam::atomic::AtomicCell;
use log::{debug, error, info, warn};
use serde_json::json;
use smol_str::{SmolStr, ToSmolStr};
use tokio::{
   sync::{RwLock, oneshot},
   task::{JoinHandle, JoinSet},
   time,
};

use crate::{
   aacp::{
      parser::{self, Frame},
      protocol::{
         BatteryInfo, ControlCommand, ControlCommandId, ConversationAwareness, DeviceInformation,
         EarDetectionStatus, HDR_ACK_FEATURES, HDR_ACK_HANDSHAKE, HeadOrientation, MediaEq,
         NoiseControlMode, PKT_HANDSHAKE, PKT_REQUEST_NOTIFY, PKT_SET_FEATURES,
         build_control_command, build_media_eq, build_rename,
      },
      registry::{ControlRegistry, ListenerHub, ListenerToken},
   },
   bluetooth::l2cap::{self, L2CapReceiver, L2CapSender, Packet, PSM_AACP},
   config::Config,
   error::{Error, Result},
   event::{DeviceEvent, EventSender},
};

/// Lifecycle of the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum SessionState {
   Disconnected,
   Connecting,
   Handshaking,
   Ready,
}

/// Internal state for an active L2CAP connection.
#[derive(Debug)]
struct ConnectionState {
   sender: l2cap::L2CapSender,
   jset: JoinSet<()>,
}

impl Drop for ConnectionState {
   fn drop(&mut self) {
      self.jset.abort_all();
   }
}

/// Internal shared state for a device session.
struct SessionInner {
   address: Address,
   address_str: SmolStr,
   name: parking_lot::Mutex<SmolStr>,
   config: Config,
   state: AtomicCell<SessionState>,
   battery: AtomicCell<Option<BatteryInfo>>,
   ear_detection: AtomicCell<Option<EarDetectionStatus>>,
   noise_mode: AtomicCell<Option<NoiseControlMode>>,
   conversation: AtomicCell<Option<ConversationAwareness>>,
   head_orientation: AtomicCell<Option<HeadOrientation>>,
   media_eq: AtomicCell<Option<MediaEq>>,
   device_info: parking_lot::Mutex<Option<DeviceInformation>>,
   registry: ControlRegistry,
   hub: ListenerHub,
   conn: RwLock<Option<ConnectionState>>,
}

/// Represents a device session on the accessory control channel.
///
/// This type is cheaply cloneable and thread-safe.
#[derive(Clone)]
pub struct AacpSession(Arc<SessionInner>);

/// Weak reference to a session.
#[derive(Clone)]
pub struct WeakAacpSession(Weak<SessionInner>);

impl WeakAacpSession {
   pub fn new(session: &AacpSession) -> Self {
      Self(Arc::downgrade(&session.0))
   }

   pub fn upgrade(&self) -> Option<AacpSession> {
      self.0.upgrade().map(AacpSession)
   }
}

impl fmt::Debug for AacpSession {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("AacpSession")
         .field("address", &self.0.address_str)
         .field("name", &*self.0.name.lock())
         .field("state", &self.0.state.load())
         .finish()
   }
}

/// Represents the result of an update operation on session state.
#[derive(Debug, Clone, Copy)]
pub enum UpdateOp<T> {
   /// No change occurred
   Noop,
   /// A new value was inserted (None -> Some)
   Inserted,
   /// A value was deleted (Some -> None)
   Deleted(T),
   /// An existing value was updated
   Updated(T),
}

impl<T: PartialEq> UpdateOp<T> {
   fn apply_atomic(dst: &AtomicCell<Option<T>>, new: Option<T>) -> Self
   where
      T: Copy,
   {
      Self::new(dst.swap(new), new)
   }

   fn new(prev: Option<T>, new: Option<T>) -> Self {
      match (prev, new) {
         (Some(p), Some(n)) if p == n => Self::Noop,
         (None, Some(_)) => Self::Inserted,
         (Some(p), None) => Self::Deleted(p),
         (Some(_), Some(n)) => Self::Updated(n),
         (None, None) => Self::Noop,
      }
   }

   const fn is_updated(&self) -> bool {
      matches!(self, Self::Inserted | Self::Updated(_))
   }
}

impl AacpSession {
   /// Creates a new session for the device at `address`.
   pub fn new(address: Address, name: String, config: Config) -> Self {
      Self(Arc::new(SessionInner {
         address,
         address_str: address.to_smolstr(),
         name: parking_lot::Mutex::new(name.into()),
         config,
         state: AtomicCell::new(SessionState::Disconnected),
         battery: AtomicCell::new(None),
         ear_detection: AtomicCell::new(None),
         noise_mode: AtomicCell::new(None),
         conversation: AtomicCell::new(None),
         head_orientation: AtomicCell::new(None),
         media_eq: AtomicCell::new(None),
         device_info: parking_lot::Mutex::new(None),
         registry: ControlRegistry::new(),
         hub: ListenerHub::new(),
         conn: RwLock::new(None),
      }))
   }

   pub fn address(&self) -> Address {
      self.0.address
   }

   pub fn address_str(&self) -> &SmolStr {
      &self.0.address_str
   }

   pub fn name(&self) -> SmolStr {
      self.0.name.lock().clone()
   }

   fn update_name(&self, name: SmolStr) -> UpdateOp<SmolStr> {
      let mut lock = self.0.name.lock();
      if lock.as_str() == name.as_str() {
         return UpdateOp::Noop;
      }
      UpdateOp::Updated(std::mem::replace(&mut *lock, name))
   }

   pub fn state(&self) -> SessionState {
      self.0.state.load()
   }

   pub fn is_connected(&self) -> bool {
      self.0.state.load() == SessionState::Ready
   }

   pub fn battery_info(&self) -> Option<BatteryInfo> {
      self.0.battery.load()
   }

   pub fn ear_detection(&self) -> Option<EarDetectionStatus> {
      self.0.ear_detection.load()
   }

   pub fn noise_mode(&self) -> Option<NoiseControlMode> {
      self.0.noise_mode.load()
   }

   pub fn conversation_awareness(&self) -> Option<ConversationAwareness> {
      self.0.conversation.load()
   }

   pub fn head_orientation(&self) -> Option<HeadOrientation> {
      self.0.head_orientation.load()
   }

   pub fn media_eq(&self) -> Option<MediaEq> {
      self.0.media_eq.load()
   }

   pub fn device_information(&self) -> Option<DeviceInformation> {
      self.0.device_info.lock().clone()
   }

   /// Last observed value of a control command, locally sent or echoed.
   pub fn control_value(&self, id: ControlCommandId) -> Option<Packet> {
      self.0.registry.lookup(id)
   }

   /// Snapshot of every control command observed this session, in
   /// identifier order.
   pub fn control_commands(&self) -> std::collections::BTreeMap<ControlCommandId, Packet> {
      self.0.registry.snapshot()
   }

   /// Registers a listener for one control command identifier. Registering
   /// the same closure twice yields two independent registrations.
   pub fn register_listener<F>(&self, id: ControlCommandId, listener: F) -> ListenerToken
   where
      F: Fn(&ControlCommand) + Send + Sync + 'static,
   {
      self.0.hub.register(id, listener)
   }

   pub fn unregister_listener(&self, token: ListenerToken) {
      self.0.hub.unregister(token);
   }

   /// Converts the session state to a JSON representation.
   pub fn to_json(&self) -> serde_json::Value {
      let mut info = json!({
          "address": self.address_str().as_str(),
          "name": self.name().as_str(),
          "connected": self.is_connected(),
      });

      if let Some(battery) = self.battery_info() {
         info["battery"] = battery.to_json();
      }
      if let Some(mode) = self.noise_mode() {
         info["noise_mode"] = json!(mode.to_str());
      }
      if let Some(ear) = self.ear_detection() {
         info["ear_detection"] = ear.to_json();
      }
      if let Some(ca) = self.conversation_awareness() {
         info["conversation_awareness"] = json!({
             "level": ca.level,
             "speaking": ca.is_speaking(),
         });
      }
      if let Some(device) = self.device_information() {
         info["device"] = json!(device);
      }

      let commands: serde_json::Map<String, serde_json::Value> = self
         .0
         .registry
         .snapshot()
         .into_iter()
         .map(|(id, value)| (id.to_string(), json!(hex::encode(value))))
         .collect();
      info["control_commands"] = json!(commands);
      info
   }

   /// Establishes the control channel connection and runs the handshake
   /// sequence. The handshake acknowledgement is mandatory; not seeing it
   /// within the configured window fails the connection.
   ///
   /// Returns a join handle that resolves when the connection is closed.
   pub async fn connect(&self, event_tx: &EventSender) -> Result<JoinHandle<Option<Error>>> {
      let address = self.address();
      let config = &self.0.config;
      let params = l2cap::LinkParams {
         psm: PSM_AACP,
         connect_timeout: config.connect_timeout(),
         write_timeout: config.write_timeout(),
      };
      self
         .connect_with(event_tx, move |hooks| async move {
            let mut jset = JoinSet::new();
            let (receiver, sender) = l2cap::connect(&mut jset, hooks, address, params).await?;
            Ok((receiver, sender, jset))
         })
         .await
   }

   /// Connection body behind [`Self::connect`]. The connector produces the
   /// link halves with the handshake hooks installed; everything from the
   /// handshake onward is independent of how the link came up.
   async fn connect_with<F, Fut>(
      &self,
      event_tx: &EventSender,
      connector: F,
   ) -> Result<JoinHandle<Option<Error>>>
   where
      F: FnOnce(l2cap::Hooks) -> Fut,
      Fut: Future<Output = Result<(L2CapReceiver, L2CapSender, JoinSet<()>)>>,
   {
      info!("Connecting to {}", self.address());
      let mut conn = self.0.conn.write().await;
      let _ = conn.take();
      self.0.state.store(SessionState::Connecting);

      let (hooks, hs_ack_rx, feat_ack_rx) = Self::handshake_hooks();
      let result = async {
         let (receiver, sender, mut jset) = connector(hooks).await?;
         self.run_handshake(&sender, hs_ack_rx, feat_ack_rx).await?;
         self.spawn_notify_retry(&mut jset, sender.clone());
         Ok((receiver, sender, jset))
      }
      .await;

      let (receiver, sender, jset) = match result {
         Ok(parts) => parts,
         Err(e) => {
            self.0.state.store(SessionState::Disconnected);
            return Err(e);
         },
      };

      let jhandle = self.start_packet_processor(receiver, event_tx.clone());

      *conn = Some(ConnectionState { sender, jset });
      self.0.state.store(SessionState::Ready);
      event_tx.emit(self, DeviceEvent::DeviceConnected);

      info!("Successfully connected to {}", self.address());
      Ok(jhandle)
   }

   /// Tears the connection down. Typed snapshots and the command cache are
   /// retained so the last known state stays queryable while disconnected.
   pub async fn disconnect(&self) {
      self.0.state.store(SessionState::Disconnected);
      let _ = self.0.conn.write().await.take();
      info!("Disconnected from {}", self.address());
   }

   async fn notify_disconnected(&self, event_tx: &EventSender) {
      self.0.state.store(SessionState::Disconnected);
      let _ = self.0.conn.write().await.take();
      info!("Disconnected from {}", self.address());
      event_tx.emit(self, DeviceEvent::DeviceDisconnected);
   }

   /// Builds the inbound taps that surface the two acknowledgement packets
   /// to [`Self::run_handshake`] without consuming them from the receive
   /// path.
   fn handshake_hooks() -> (l2cap::Hooks, oneshot::Receiver<()>, oneshot::Receiver<()>) {
      let (hs_ack_tx, hs_ack_rx) = oneshot::channel();
      let (feat_ack_tx, feat_ack_rx) = oneshot::channel();

      let hooks = l2cap::Hooks::new()
         .prefix_once(HDR_ACK_HANDSHAKE, |_| {
            let _ = hs_ack_tx.send(());
         })
         .prefix_once(HDR_ACK_FEATURES, |_| {
            let _ = feat_ack_tx.send(());
         });
      (hooks, hs_ack_rx, feat_ack_rx)
   }

   async fn run_handshake(
      &self,
      sender: &L2CapSender,
      mut hs_ack_rx: oneshot::Receiver<()>,
      mut feat_ack_rx: oneshot::Receiver<()>,
   ) -> Result<()> {
      let config = &self.0.config;
      self.0.state.store(SessionState::Handshaking);
      info!("Starting handshake sequence...");

      if let Err(e) = sender.send(PKT_HANDSHAKE).await {
         error!("Failed to send handshake: {e:?}");
         return Err(e);
      }
      match time::timeout(config.handshake_timeout(), &mut hs_ack_rx).await {
         Ok(Ok(())) => info!("Handshake acknowledged"),
         Ok(Err(_)) => return Err(Error::ConnectionClosed),
         Err(_) => return Err(Error::HandshakeFailed("no acknowledgement within timeout")),
      }

      // The features ack is not load-bearing; some firmwares never send it.
      if let Err(e) = sender.send(PKT_SET_FEATURES).await {
         error!("Failed to send features: {e:?}");
         return Err(e);
      }
      if time::timeout(config.handshake_timeout(), &mut feat_ack_rx)
         .await
         .is_err()
      {
         warn!("No features acknowledgment received, continuing anyway...");
      }

      if let Err(e) = sender.send(PKT_REQUEST_NOTIFY).await {
         error!("Failed to send notification request: {e:?}");
         return Err(e);
      }

      info!("{}: Handshake sequence completed", self.address());
      Ok(())
   }

   /// Re-requests notifications until the first battery frame lands; some
   /// firmwares miss the first request right after the handshake.
   fn spawn_notify_retry(&self, jset: &mut JoinSet<()>, sender: L2CapSender) {
      let weak = WeakAacpSession::new(self);
      let mac = self.address();
      jset.spawn(async move {
         const RETRY_SCHEDULE: &[std::time::Duration] = &[
            std::time::Duration::from_secs(1),
            std::time::Duration::from_secs(2),
            std::time::Duration::from_secs(3),
            std::time::Duration::from_secs(5),
            std::time::Duration::from_secs(10),
         ];

         for (i, delay) in RETRY_SCHEDULE.iter().enumerate() {
            time::sleep(*delay).await;
            match weak.upgrade() {
               Some(this) if this.battery_info().is_some() => {
                  info!("{mac}: Battery status established after {i} retries");
                  return;
               },
               Some(_) => {},
               None => return,
            }
            warn!("{mac}: [Retry {i}] No battery status yet, re-requesting notifications");
            let _ = sender.send(PKT_REQUEST_NOTIFY).await;
         }
      });
   }

   fn start_packet_processor(
      &self,
      mut rx: l2cap::L2CapReceiver,
      event_tx: EventSender,
   ) -> JoinHandle<Option<Error>> {
      let addr = self.address();
      let weak = WeakAacpSession::new(self);
      tokio::spawn(async move {
         let mut err = None;
         loop {
            match rx.recv().await {
               Ok(packet) => {
                  if let Some(this) = weak.upgrade() {
                     this.process_packet(addr, &packet, &event_tx);
                  } else {
                     warn!("{addr}: Session instance was dropped");
                     break;
                  }
               },
               Err(e) => {
                  if let Some(this) = weak.upgrade() {
                     // an explicit disconnect() also tears the link down;
                     // only an unexpected failure is an error
                     if this.state() != SessionState::Disconnected {
                        event_tx.emit(&this, DeviceEvent::DeviceError);
                     }
                     this.notify_disconnected(&event_tx).await;
                  } else {
                     warn!("{addr}: Connection closed: {e:?}");
                  }
                  err = Some(e);
                  break;
               },
            }
         }
         err
      })
   }

   /// Sends a control command and records its value optimistically. A later
   /// echo for the same identifier overwrites the optimistic entry, so the
   /// cache always reflects arrival order.
   pub async fn send_control_command(&self, id: ControlCommandId, value: &[u8]) -> Result<()> {
      let conn = self.0.conn.read().await;
      let Some(conn) = conn.as_ref() else {
         return Err(Error::DeviceNotConnected);
      };

      let packet = build_control_command(id, value);
      conn.sender.send(&packet).await?;

      let command = ControlCommand {
         id,
         value: Packet::from_slice(value),
      };
      self.0.registry.record(&command);
      self.0.hub.dispatch(&command);
      Ok(())
   }

   pub async fn send_control_command_u8(&self, id: ControlCommandId, value: u8) -> Result<()> {
      self.send_control_command(id, &[value]).await
   }

   /// Enabled encodes as 0x01 and disabled as 0x02 on the wire.
   pub async fn send_control_command_bool(
      &self,
      id: ControlCommandId,
      enabled: bool,
   ) -> Result<()> {
      self
         .send_control_command(id, &[if enabled { 0x01 } else { 0x02 }])
         .await
   }

   pub async fn set_noise_control(&self, mode: NoiseControlMode) -> Result<()> {
      self
         .send_control_command_u8(ControlCommandId::ListeningMode, mode as u8)
         .await?;
      self.0.noise_mode.store(Some(mode));
      Ok(())
   }

   pub async fn send_media_eq(&self, eq: &MediaEq) -> Result<()> {
      let conn = self.0.conn.read().await;
      let Some(conn) = conn.as_ref() else {
         return Err(Error::DeviceNotConnected);
      };
      conn.sender.send(&build_media_eq(eq)).await?;
      self.0.media_eq.store(Some(*eq));
      Ok(())
   }

   pub async fn rename(&self, name: &str) -> Result<()> {
      let conn = self.0.conn.read().await;
      let Some(conn) = conn.as_ref() else {
         return Err(Error::DeviceNotConnected);
      };
      conn.sender.send(&build_rename(name)).await?;
      self.update_name(name.into());
      Ok(())
   }

   /// Sends a raw packet on the control channel.
   pub async fn passthrough(&self, packet: &[u8]) -> Result<()> {
      let conn = self.0.conn.read().await;
      if let Some(conn) = conn.as_ref() {
         conn.sender.send(packet).await?;
         Ok(())
      } else {
         Err(Error::DeviceNotConnected)
      }
   }

   fn process_packet(&self, address: Address, packet: &Packet, event_tx: &EventSender) {
      let frame = match parser::classify(packet) {
         Ok(frame) => frame,
         Err(e) => {
            warn!("{address}: Dropping malformed frame: {e}");
            return;
         },
      };

      match frame {
         Frame::Battery(battery) => {
            debug!("Battery updated for {address}: {battery}");
            if UpdateOp::apply_atomic(&self.0.battery, Some(battery)).is_updated() {
               event_tx.emit(self, DeviceEvent::BatteryUpdated(battery));
            }
         },
         Frame::NoiseControl(mode) => {
            debug!("Noise mode updated for {address}: {mode}");
            // the noise frame doubles as the listening-mode echo
            let command = ControlCommand {
               id: ControlCommandId::ListeningMode,
               value: Packet::from_slice(&[mode as u8]),
            };
            self.0.registry.record(&command);
            self.0.hub.dispatch(&command);
            if UpdateOp::apply_atomic(&self.0.noise_mode, Some(mode)).is_updated() {
               event_tx.emit(self, DeviceEvent::NoiseControlChanged(mode));
            }
         },
         Frame::EarDetection(status) => {
            debug!("Ear detection updated for {address}: {status:?}");
            if UpdateOp::apply_atomic(&self.0.ear_detection, Some(status)).is_updated() {
               event_tx.emit(self, DeviceEvent::EarDetectionChanged(status));
            }
         },
         Frame::ConversationAwareness(ca) => {
            debug!("Conversation awareness for {address}: level {}", ca.level);
            if UpdateOp::apply_atomic(&self.0.conversation, Some(ca)).is_updated() {
               event_tx.emit(self, DeviceEvent::ConversationAwarenessChanged(ca));
            }
         },
         Frame::HeadTracking(orientation) => {
            if UpdateOp::apply_atomic(&self.0.head_orientation, Some(orientation)).is_updated() {
               event_tx.emit(self, DeviceEvent::HeadOrientationChanged(orientation));
            }
         },
         Frame::ControlCommand(command) => {
            debug!(
               "Control command from {address}: {} = {}",
               command.id,
               hex::encode(&command.value)
            );
            if command.id == ControlCommandId::ListeningMode
               && let Some(mode) = command.value.first().copied().and_then(NoiseControlMode::from_repr)
               && UpdateOp::apply_atomic(&self.0.noise_mode, Some(mode)).is_updated()
            {
               event_tx.emit(self, DeviceEvent::NoiseControlChanged(mode));
            }
            self.0.registry.record(&command);
            self.0.hub.dispatch(&command);
            event_tx.emit(self, DeviceEvent::ControlCommandUpdated(command));
         },
         Frame::StemPress(press) => {
            debug!("Stem press from {address}: {} {}", press.bud, press.kind);
            event_tx.emit(self, DeviceEvent::StemPressed(press));
         },
         Frame::MediaEq(eq) => {
            if UpdateOp::apply_atomic(&self.0.media_eq, Some(eq)).is_updated() {
               event_tx.emit(self, DeviceEvent::MediaEqUpdated(eq));
            }
         },
         Frame::DeviceInformation(device) => {
            debug!("Device information for {address}: {device:?}");
            if !device.name.is_empty() {
               self.update_name(device.name.clone());
            }
            let changed = {
               let mut lock = self.0.device_info.lock();
               let changed = lock.as_ref() != Some(&device);
               *lock = Some(device.clone());
               changed
            };
            if changed {
               event_tx.emit(self, DeviceEvent::DeviceInformationUpdated(device));
            }
         },
         Frame::HandshakeAck => debug!("Received handshake ACK from {address}"),
         Frame::FeaturesAck => debug!("Received features ACK from {address}"),
         Frame::Unrecognized => {
            let data = if packet.len() < 16 {
               hex::encode(packet)
            } else {
               format!(
                  "{}..{}",
                  hex::encode(&packet[..8]),
                  hex::encode(&packet[8..])
               )
            };
            debug!(
               "Unknown packet from {} | {} bytes => {}",
               address,
               packet.len(),
               data
            );
         },
      }
   }
}
