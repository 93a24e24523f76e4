//! Control-command status cache and listener hub.
//!
//! The registry keeps the last observed value per command identifier,
//! written both optimistically on send and authoritatively on echo. The hub
//! fans observed commands out to registered listeners.

use std::{
   collections::{BTreeMap, HashMap},
   panic::{AssertUnwindSafe, catch_unwind},
   sync::atomic::{AtomicU64, Ordering},
};

use log::warn;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::{
   aacp::protocol::{ControlCommand, ControlCommandId},
   bluetooth::l2cap::Packet,
};

/// Last-observed value per control command. Values are replaced wholesale;
/// an absent entry means the command has never been observed, which is
/// distinct from an observed empty value.
#[derive(Default)]
pub struct ControlRegistry {
   values: Mutex<HashMap<ControlCommandId, Packet>>,
}

impl ControlRegistry {
   pub fn new() -> Self {
      Self::default()
   }

   /// Records a value, overwriting whatever was there. Last writer wins by
   /// arrival order regardless of whether the write came from an optimistic
   /// local send or a device echo.
   pub fn record(&self, command: &ControlCommand) {
      self.values.lock().insert(command.id, command.value.clone());
   }

   pub fn lookup(&self, id: ControlCommandId) -> Option<Packet> {
      self.values.lock().get(&id).cloned()
   }

   /// Copies the whole cache in identifier order, for status dumps.
   pub fn snapshot(&self) -> BTreeMap<ControlCommandId, Packet> {
      self
         .values
         .lock()
         .iter()
         .map(|(id, value)| (*id, value.clone()))
         .collect()
   }
}

/// Opaque handle to a registered listener. Unregistering consumes nothing
/// and is idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(u64);

type Listener = Arc<dyn Fn(&ControlCommand) + Send + Sync>;

/// Per-command listener fan-out.
///
/// Listeners for one identifier are invoked in registration order. The same
/// closure registered twice is two listeners and sees every command twice.
#[derive(Default)]
pub struct ListenerHub {
   next_token: AtomicU64,
   listeners: Mutex<HashMap<ControlCommandId, Vec<(ListenerToken, Listener)>>>,
}

impl ListenerHub {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn register<F>(&self, id: ControlCommandId, listener: F) -> ListenerToken
   where
      F: Fn(&ControlCommand) + Send + Sync + 'static,
   {
      let token = ListenerToken(self.next_token.fetch_add(1, Ordering::Relaxed));
      self
         .listeners
         .lock()
         .entry(id)
         .or_default()
         .push((token, Arc::new(listener)));
      token
   }

   /// Removes the listener behind `token`, if it is still registered.
   pub fn unregister(&self, token: ListenerToken) {
      let mut listeners = self.listeners.lock();
      for entries in listeners.values_mut() {
         entries.retain(|(t, _)| *t != token);
      }
   }

   /// Delivers a command to every listener registered for its identifier.
   /// A panicking listener is logged and skipped; it never takes down the
   /// read loop or starves the listeners after it.
   pub fn dispatch(&self, command: &ControlCommand) {
      let matching: Vec<Listener> = {
         let listeners = self.listeners.lock();
         match listeners.get(&command.id) {
            Some(entries) => entries.iter().map(|(_, l)| l.clone()).collect(),
            None => return,
         }
      };

      for listener in matching {
         if catch_unwind(AssertUnwindSafe(|| listener(command))).is_err() {
            warn!("Listener for {} panicked", command.id);
         }
      }
   }
}

#[cfg(test)]
mod tests {
   use std::sync::atomic::AtomicUsize;

   use super::*;

   fn command(id: ControlCommandId, value: &[u8]) -> ControlCommand {
      ControlCommand {
         id,
         value: Packet::from_slice(value),
      }
   }

   #[test]
   fn last_write_wins_by_arrival() {
      let registry = ControlRegistry::new();
      registry.record(&command(ControlCommandId::ListeningMode, &[0x02]));
      registry.record(&command(ControlCommandId::ListeningMode, &[0x03]));
      assert_eq!(
         registry.lookup(ControlCommandId::ListeningMode).unwrap().as_slice(),
         &[0x03]
      );
   }

   #[test]
   fn absent_is_not_empty() {
      let registry = ControlRegistry::new();
      assert!(registry.lookup(ControlCommandId::ChimeVolume).is_none());
      registry.record(&command(ControlCommandId::ChimeVolume, &[0x00]));
      assert_eq!(
         registry.lookup(ControlCommandId::ChimeVolume).unwrap().as_slice(),
         &[0x00]
      );
   }

   #[test]
   fn double_registration_delivers_twice_in_order() {
      let hub = ListenerHub::new();
      let order = Arc::new(Mutex::new(Vec::new()));

      for tag in [1, 2] {
         let order = order.clone();
         hub.register(ControlCommandId::ListeningMode, move |_| {
            order.lock().push(tag);
         });
      }

      hub.dispatch(&command(ControlCommandId::ListeningMode, &[0x01]));
      assert_eq!(order.lock().as_slice(), &[1, 2]);
   }

   #[test]
   fn unregister_is_idempotent() {
      let hub = ListenerHub::new();
      let hits = Arc::new(AtomicUsize::new(0));
      let counter = hits.clone();
      let token = hub.register(ControlCommandId::MicMode, move |_| {
         counter.fetch_add(1, Ordering::SeqCst);
      });

      hub.unregister(token);
      hub.unregister(token);
      hub.dispatch(&command(ControlCommandId::MicMode, &[0x01]));
      assert_eq!(hits.load(Ordering::SeqCst), 0);
   }

   #[test]
   fn listeners_only_see_their_identifier() {
      let hub = ListenerHub::new();
      let hits = Arc::new(AtomicUsize::new(0));
      let counter = hits.clone();
      hub.register(ControlCommandId::MicMode, move |_| {
         counter.fetch_add(1, Ordering::SeqCst);
      });

      hub.dispatch(&command(ControlCommandId::ChimeVolume, &[0x01]));
      assert_eq!(hits.load(Ordering::SeqCst), 0);
      hub.dispatch(&command(ControlCommandId::MicMode, &[0x01]));
      assert_eq!(hits.load(Ordering::SeqCst), 1);
   }

   #[test]
   fn panicking_listener_is_isolated() {
      let hub = ListenerHub::new();
      let hits = Arc::new(AtomicUsize::new(0));

      hub.register(ControlCommandId::ListeningMode, |_| {
         panic!("listener fault");
      });
      let counter = hits.clone();
      hub.register(ControlCommandId::ListeningMode, move |_| {
         counter.fetch_add(1, Ordering::SeqCst);
      });

      hub.dispatch(&command(ControlCommandId::ListeningMode, &[0x04]));
      assert_eq!(hits.load(Ordering::SeqCst), 1);

      // the hub keeps working after a fault
      hub.dispatch(&command(ControlCommandId::ListeningMode, &[0x01]));
      assert_eq!(hits.load(Ordering::SeqCst), 2);
   }
}
