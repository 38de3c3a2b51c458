//! Installing a new configuration in a session.

use smallvec::SmallVec;

use crate::backend::{Backend, Features};
use crate::config::{CounterConfig, Preserve};
use crate::error::ControlError;
use crate::generation::Generation;
use crate::session::{CounterState, Session};
use crate::status::Status;

impl Session {
    /// Validates `config` and installs it, resetting every sum.
    ///
    /// Nothing is written to hardware; the new values are programmed by the
    /// next resume. On error the session is left exactly as it was.
    pub fn update_control(
        &mut self,
        backend: &dyn Backend,
        config: CounterConfig,
    ) -> Result<(), ControlError> {
        self.update_control_preserving(backend, config, Preserve::NONE)
    }

    /// Like [`Session::update_control`], but keeps the sums selected by
    /// `preserve`. Counter `i` of the new configuration inherits the sum of
    /// counter `i` of the old one.
    pub fn update_control_preserving(
        &mut self,
        backend: &dyn Backend,
        config: CounterConfig,
        preserve: Preserve,
    ) -> Result<(), ControlError> {
        if self.is_running() {
            return Err(ControlError::Busy("session must be suspended first"));
        }
        if !config.interrupt.is_empty() && !backend.features().contains(Features::PCINT) {
            return Err(ControlError::Unsupported(
                "overflow interrupts are not available",
            ));
        }

        let derived = backend.check_control(&config)?;
        for spec in &config.interrupt {
            backend.check_reload(spec)?;
        }

        let nr_active = config.active.len();
        let status = Status::new(config.clock, nr_active, config.interrupt.len())
            .with_quirks(derived.quirks);
        let counters = config
            .active
            .iter()
            .map(|spec| (spec.slot, 0))
            .chain(config.interrupt.iter().map(|spec| (spec.counter.slot, spec.reload)))
            .enumerate()
            .map(|(i, (slot, start))| CounterState {
                slot,
                start,
                sum: match self.counters.get(i) {
                    Some(old) if preserve.keeps_counter(i) => old.sum,
                    _ => 0,
                },
            })
            .collect::<SmallVec<[CounterState; 8]>>();
        let generation = Generation::next();

        debug!(
            "Session::update_control: {:?} with {} active and {} interrupt counters{}",
            generation,
            nr_active,
            config.interrupt.len(),
            if config.clock { " and the clock" } else { "" }
        );

        self.config = config;
        self.control = derived.control;
        self.status = status;
        self.generation = Some(generation);
        self.counters = counters;
        self.clock_start = 0;
        if !preserve.keeps_clock() {
            self.clock_sum = 0;
        }
        self.isuspend_cpu = None;
        self.pending_interrupt = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing_common::MockBackend;

    #[test]
    fn seeds_interrupt_starts_with_reload() {
        let backend = MockBackend::new(4);
        let mut session = Session::new();
        session
            .update_control(
                &backend,
                CounterConfig::new()
                    .with_clock(true)
                    .with_active(0, 1)
                    .with_interrupt(3, 2, 0xFFFF_F000),
            )
            .unwrap();

        assert_eq!(session.status(), Status::new(true, 1, 1));
        assert_eq!(session.counters()[0].start, 0);
        assert_eq!(session.counters()[1].slot, 3);
        assert_eq!(session.counters()[1].start, 0xFFFF_F000);
        assert!(session.generation().is_some());
    }

    #[test]
    fn failed_update_leaves_session_untouched() {
        let backend = MockBackend::new(2);
        let mut session = Session::new();
        session
            .update_control(&backend, CounterConfig::new().with_active(1, 7))
            .unwrap();
        let generation = session.generation();
        let control = session.control().clone();
        let status = session.status();

        let too_many = CounterConfig::new()
            .with_active(0, 1)
            .with_active(1, 1)
            .with_active(2, 1);
        assert!(matches!(
            session.update_control(&backend, too_many),
            Err(ControlError::TooManyCounters { .. })
        ));
        let bad_reload = CounterConfig::new().with_interrupt(0, 1, 5);
        assert_eq!(
            session.update_control(&backend, bad_reload),
            Err(ControlError::InvalidReload { slot: 0, reload: 5 })
        );

        assert_eq!(session.generation(), generation);
        assert_eq!(session.control(), &control);
        assert_eq!(session.status(), status);
        assert_eq!(session.config().active[0].slot, 1);
    }

    #[test]
    fn interrupt_counters_need_interrupt_support() {
        let backend = MockBackend::new(2).without_interrupts();
        let mut session = Session::new();
        assert!(matches!(
            session.update_control(
                &backend,
                CounterConfig::new().with_interrupt(0, 1, 0x8000_0000)
            ),
            Err(ControlError::Unsupported(_))
        ));
        assert_eq!(session.generation(), None);
    }

    #[test]
    fn preserve_keeps_selected_sums() {
        let backend = MockBackend::new(4);
        let mut session = Session::new();
        session
            .update_control(&backend, CounterConfig::new().with_active(0, 1).with_active(1, 1))
            .unwrap();
        session.counters[0].sum = 100;
        session.counters[1].sum = 200;
        session.clock_sum = 300;

        session
            .update_control_preserving(
                &backend,
                CounterConfig::new().with_active(2, 1).with_active(3, 1),
                Preserve::counter(1) | Preserve::CLOCK,
            )
            .unwrap();
        assert_eq!(session.sums().as_slice(), &[0, 200]);
        assert_eq!(session.clock_sum(), 300);

        session
            .update_control(&backend, CounterConfig::new().with_active(2, 1))
            .unwrap();
        assert_eq!(session.sums().as_slice(), &[0]);
        assert_eq!(session.clock_sum(), 0);
    }

    #[test]
    fn empty_config_is_legal() {
        let backend = MockBackend::new(4);
        let mut session = Session::new();
        session.update_control(&backend, CounterConfig::new()).unwrap();
        assert_eq!(session.status(), Status::NONE);
        assert!(session.generation().is_some());
    }

    #[test]
    fn running_sessions_are_busy() {
        let backend = MockBackend::new(4);
        let mut session = Session::new();
        session.run_state = crate::session::RunState::Running { cpu: 0 };
        assert!(matches!(
            session.update_control(&backend, CounterConfig::new()),
            Err(ControlError::Busy(_))
        ));
    }
}
