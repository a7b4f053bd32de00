//! Peripheral discovery for configured lights.
//!
//! One scan pass runs for a bounded window, hands every LE peripheral whose
//! address belongs to a target session over to that session, and then tells
//! the sessions that were never matched that the pass is over. Nothing is
//! retried.

use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::StreamExt;
use log::{debug, warn};
use smol_str::{SmolStr, format_smolstr};
use tokio::{
   task::JoinHandle,
   time::{self, Instant},
};

use crate::{
   bluetooth::{Central, Peripheral, address::PeripheralAddress},
   light::session::Session,
};

/// Default length of a discovery pass.
pub const DEFAULT_DISCOVERY_WINDOW: Duration = Duration::from_millis(5000);
/// How long an expired open waits for its pass to report unmatched lights.
const WIND_DOWN_GRACE: Duration = Duration::from_millis(100);

/// Why a scan pass ended.
#[derive(Debug, Clone, PartialEq, Eq, strum::Display)]
pub enum ScanEnd {
   /// Window elapsed, or every target was matched.
   Finished,
   /// Discovery stopped underneath us.
   Canceled,
   Error(SmolStr),
}

pub struct Scanner<C: Central> {
   central: Arc<C>,
   window: Duration,
   targets: HashMap<PeripheralAddress, Vec<Session<C>>>,
}

impl<C: Central> Scanner<C> {
   pub fn new(central: Arc<C>, window: Duration) -> Self {
      Self {
         central,
         window,
         targets: HashMap::new(),
      }
   }

   /// Adds a session whose peripheral should be looked for.
   pub fn target(mut self, session: Session<C>) -> Self {
      self
         .targets
         .entry(session.address())
         .or_default()
         .push(session);
      self
   }

   /// Starts the pass in the background.
   pub fn start(self) -> JoinHandle<ScanEnd> {
      tokio::spawn(self.run())
   }

   async fn run(mut self) -> ScanEnd {
      let deadline = Instant::now() + self.window;
      debug!(
         "Scanning for {} light(s) for {:?}",
         self.targets.len(),
         self.window
      );

      let discovered = time::timeout_at(deadline, self.central.discover()).await;
      let end = match discovered {
         Err(_) => {
            warn!("Discovery did not start within {:?}", self.window);
            ScanEnd::Finished
         },
         Ok(Ok(mut found)) => loop {
            if self.targets.is_empty() {
               break ScanEnd::Finished;
            }
            match time::timeout_at(deadline, found.next()).await {
               Err(_) => break ScanEnd::Finished,
               Ok(None) => break ScanEnd::Canceled,
               Ok(Some(Err(e))) => break ScanEnd::Error(format_smolstr!("{e}")),
               Ok(Some(Ok(peripheral))) => self.offer(peripheral).await,
            }
         },
         Ok(Err(e)) => ScanEnd::Error(format_smolstr!("{e}")),
      };

      match &end {
         ScanEnd::Finished => debug!("Scan finished."),
         ScanEnd::Canceled => debug!("Scan canceled."),
         ScanEnd::Error(e) => warn!("Device scan error: {e}"),
      }

      for session in self.targets.values().flatten() {
         session.scan_ended().await;
      }
      end
   }

   async fn offer(&mut self, peripheral: C::Peripheral) {
      let info = peripheral.info();
      if !info.low_energy {
         return;
      }
      let Some(sessions) = self.targets.remove(&info.address) else {
         return;
      };

      debug!(
         "Last device added: {} ({})",
         info.name.as_deref().unwrap_or("<unnamed>"),
         info.address
      );
      for session in sessions {
         session.peripheral_matched(peripheral.clone()).await;
      }
   }
}

/// Waits briefly for a pass to tell its unmatched targets that it ended.
///
/// The pass keeps running in the background if it overruns the grace period.
pub(crate) async fn wind_down(scan: JoinHandle<ScanEnd>) {
   if time::timeout(WIND_DOWN_GRACE, scan).await.is_err() {
      debug!("Scan still running after the open deadline");
   }
}
