//! Manual override entry point: pump toggling and mode switching. Owns the
//! start/stop lifecycle of the automation loop.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::automation::{self, AutomationSettings};
use crate::error::ControlError;
use crate::gateway::Actuator;
use crate::state::{ControlHandle, Mode, PumpState};

/// Result of a mode request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeChange {
    pub mode: Mode,
    /// Generation of the loop started by this request, if one was started.
    pub started_generation: Option<u64>,
    pub changed: bool,
}

#[derive(Clone)]
pub struct Controller {
    state: ControlHandle,
    actuator: Arc<dyn Actuator>,
    settings: AutomationSettings,
    /// Held from a mode mutation until its announcement is published, so
    /// announcements leave in the order the mode changed.
    mode_change: Arc<Mutex<()>>,
}

impl Controller {
    pub fn new(
        state: ControlHandle,
        actuator: Arc<dyn Actuator>,
        settings: AutomationSettings,
    ) -> Self {
        Self {
            state,
            actuator,
            settings,
            mode_change: Arc::new(Mutex::new(())),
        }
    }

    pub fn state(&self) -> &ControlHandle {
        &self.state
    }

    /// Flip the pump. Only valid in Manual mode.
    ///
    /// The read, the command and the write all happen under the state lock,
    /// so two concurrent toggles never observe the same pre-state. The
    /// command is bounded by the configured timeout.
    pub async fn toggle(&self) -> Result<(PumpState, Mode), ControlError> {
        let mut st = self.state.write().await;
        if st.mode() != Mode::Manual {
            return Err(ControlError::InvalidAction);
        }

        let next = st.pump_state().inverse();
        if let Err(e) =
            automation::send_command(self.actuator.as_ref(), next, self.settings.command_timeout)
                .await
        {
            warn!("manual pump {next} failed: {e}");
            st.record_error(format!("manual pump {next} failed: {e}"));
            return Err(e);
        }

        st.set_pump_state(next);
        info!("manual pump {next}");
        Ok((next, st.mode()))
    }

    /// Parse and apply a requested mode (`"auto"` or `"manual"`).
    pub async fn set_mode(&self, requested: &str) -> Result<ModeChange, ControlError> {
        let mode: Mode = requested.parse()?;
        Ok(self.apply_mode(mode).await)
    }

    /// Same-mode requests are no-ops. Manual→Auto opens a new generation and
    /// starts a loop bound to it; Auto→Manual only flips the mode and lets
    /// the running loop notice on its own.
    pub async fn apply_mode(&self, mode: Mode) -> ModeChange {
        let _ordered = self.mode_change.lock().await;
        let started_generation = {
            let mut st = self.state.write().await;
            if st.mode() == mode {
                return ModeChange {
                    mode,
                    started_generation: None,
                    changed: false,
                };
            }
            match mode {
                Mode::Auto => Some(st.enter_auto()),
                Mode::Manual => {
                    st.set_mode(Mode::Manual);
                    None
                }
            }
        };

        if let Some(generation) = started_generation {
            let handle = tokio::spawn(automation::run(
                self.state.clone(),
                Arc::clone(&self.actuator),
                self.settings,
                generation,
            ));
            automation::watch(handle, generation);
        }
        info!(%mode, ?started_generation, "mode changed");

        self.announce(mode).await;

        ModeChange {
            mode,
            started_generation,
            changed: true,
        }
    }

    async fn announce(&self, mode: Mode) {
        let announced =
            tokio::time::timeout(self.settings.command_timeout, self.actuator.announce_mode(mode))
                .await;
        let failure = match announced {
            Ok(Ok(())) => return,
            Ok(Err(e)) => format!("{e:#}"),
            Err(_) => "timed out".to_string(),
        };
        warn!(%mode, "mode announcement failed: {failure}");
        self.state
            .record_error(format!("mode announcement failed: {failure}"))
            .await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{GatewayActuator, SimGateway};
    use crate::state::SensorReading;
    use std::time::Duration;

    fn controller() -> (Controller, Arc<SimGateway>) {
        let sim = Arc::new(SimGateway::new());
        let actuator: Arc<dyn Actuator> = Arc::new(GatewayActuator::new(sim.clone()));
        let settings = AutomationSettings {
            command_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        (Controller::new(ControlHandle::new(), actuator, settings), sim)
    }

    // -- toggle -------------------------------------------------------------

    #[tokio::test]
    async fn toggle_flips_pump_in_manual() {
        let (ctl, sim) = controller();
        assert_eq!(ctl.toggle().await, Ok((PumpState::On, Mode::Manual)));
        assert_eq!(ctl.toggle().await, Ok((PumpState::Off, Mode::Manual)));
        assert_eq!(sim.commands(), vec![PumpState::On, PumpState::Off]);
    }

    #[tokio::test]
    async fn toggle_rejected_in_auto() {
        let (ctl, sim) = controller();
        ctl.apply_mode(Mode::Auto).await;

        assert_eq!(ctl.toggle().await, Err(ControlError::InvalidAction));
        assert_eq!(ctl.state().snapshot().await.pump_state, PumpState::Off);
        assert!(sim.commands().is_empty());
    }

    #[tokio::test]
    async fn toggle_failure_keeps_state() {
        let (ctl, sim) = controller();
        sim.fail_commands(true);
        let err = ctl.toggle().await.unwrap_err();
        assert!(matches!(err, ControlError::ActuatorCommand(_)));
        assert_eq!(ctl.state().snapshot().await.pump_state, PumpState::Off);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_toggles_never_share_a_pre_state() {
        let (ctl, sim) = controller();

        let tasks: Vec<_> = (0..25)
            .map(|_| {
                let ctl = ctl.clone();
                tokio::spawn(async move { ctl.toggle().await })
            })
            .collect();
        for t in tasks {
            t.await.unwrap().unwrap();
        }

        let commands = sim.commands();
        assert_eq!(commands.len(), 25);
        for (i, cmd) in commands.iter().enumerate() {
            let expected = if i % 2 == 0 { PumpState::On } else { PumpState::Off };
            assert_eq!(*cmd, expected, "command {i} out of sequence");
        }
        assert_eq!(ctl.state().snapshot().await.pump_state, PumpState::On);
    }

    // -- set_mode -----------------------------------------------------------

    #[tokio::test]
    async fn invalid_mode_rejected_without_mutation() {
        let (ctl, _sim) = controller();
        let err = ctl.set_mode("turbo").await.unwrap_err();
        assert_eq!(err, ControlError::InvalidModeValue("turbo".into()));
        let snap = ctl.state().snapshot().await;
        assert_eq!(snap.mode, Mode::Manual);
        assert_eq!(snap.loop_generation, 0);
    }

    #[tokio::test]
    async fn same_mode_is_noop() {
        let (ctl, _sim) = controller();
        let change = ctl.set_mode("manual").await.unwrap();
        assert!(!change.changed);
        assert_eq!(ctl.state().snapshot().await.loop_generation, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_twice_starts_one_loop() {
        let (ctl, sim) = controller();
        ctl.state()
            .apply_reading(&SensorReading {
                soil_percent: Some(10.0),
                ..Default::default()
            })
            .await;

        let first = ctl.set_mode("auto").await.unwrap();
        let second = ctl.set_mode("auto").await.unwrap();
        assert_eq!(first.started_generation, Some(1));
        assert_eq!(second.started_generation, None);
        assert!(!second.changed);
        assert_eq!(ctl.state().snapshot().await.loop_generation, 1);

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(sim.commands(), vec![PumpState::On]);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_manual_auto_supersedes_previous_loop() {
        let (ctl, _sim) = controller();
        ctl.set_mode("auto").await.unwrap();
        ctl.set_mode("manual").await.unwrap();
        let change = ctl.set_mode("auto").await.unwrap();
        assert_eq!(change.started_generation, Some(2));

        let snap = ctl.state().snapshot().await;
        assert_eq!(snap.mode, Mode::Auto);
        assert_eq!(snap.loop_generation, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_does_not_touch_relay() {
        let (ctl, sim) = controller();
        ctl.state()
            .apply_reading(&SensorReading {
                soil_percent: Some(10.0),
                ..Default::default()
            })
            .await;
        ctl.set_mode("auto").await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(sim.commands(), vec![PumpState::On]);

        ctl.set_mode("manual").await.unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;
        // Relay left in its last commanded state.
        assert_eq!(sim.commands(), vec![PumpState::On]);
        assert_eq!(ctl.state().snapshot().await.pump_state, PumpState::On);
    }

    struct Announcer {
        sim: Arc<SimGateway>,
        modes: std::sync::Mutex<Vec<Mode>>,
        /// Extra latency before an `Auto` announcement is recorded.
        auto_delay: Duration,
    }

    impl Announcer {
        fn new(auto_delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                sim: Arc::new(SimGateway::new()),
                modes: std::sync::Mutex::new(Vec::new()),
                auto_delay,
            })
        }
    }

    #[async_trait::async_trait]
    impl Actuator for Announcer {
        async fn command(&self, state: PumpState) -> anyhow::Result<()> {
            use crate::gateway::Gateway;
            self.sim.set_pump(state).await
        }

        async fn announce_mode(&self, mode: Mode) -> anyhow::Result<()> {
            if mode == Mode::Auto {
                tokio::time::sleep(self.auto_delay).await;
            }
            self.modes.lock().unwrap().push(mode);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn effective_mode_changes_are_announced() {
        let announcer = Announcer::new(Duration::ZERO);
        let ctl = Controller::new(
            ControlHandle::new(),
            announcer.clone(),
            AutomationSettings::default(),
        );

        ctl.set_mode("auto").await.unwrap();
        ctl.set_mode("auto").await.unwrap();
        ctl.set_mode("manual").await.unwrap();

        assert_eq!(
            *announcer.modes.lock().unwrap(),
            vec![Mode::Auto, Mode::Manual]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn announcements_follow_mode_change_order() {
        let announcer = Announcer::new(Duration::from_millis(50));
        let ctl = Controller::new(
            ControlHandle::new(),
            announcer.clone(),
            AutomationSettings::default(),
        );

        let to_auto = {
            let ctl = ctl.clone();
            tokio::spawn(async move { ctl.set_mode("auto").await })
        };
        // Auto is applied and its announcement is in flight.
        tokio::time::sleep(Duration::from_millis(10)).await;
        ctl.set_mode("manual").await.unwrap();
        to_auto.await.unwrap().unwrap();

        assert_eq!(ctl.state().snapshot().await.mode, Mode::Manual);
        assert_eq!(
            *announcer.modes.lock().unwrap(),
            vec![Mode::Auto, Mode::Manual]
        );
    }
}
