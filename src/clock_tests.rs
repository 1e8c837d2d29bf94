//! Clock Tree Behavior Test Suite
//!
//! End-to-end tests of the threaded clock tree: wall-clock pacing, sibling
//! rate ratios, deterministic wake ordering, kill and hold semantics,
//! mid-wait tempo changes, fast-forwarding, and absolute envelope
//! extraction.
//!
//! Real threads and real sleeps are involved, so the tests keep wall time
//! down two ways:
//!   - fast master rates (a beat of logical time costs a few ms)
//!   - `fast_forward()` wherever pacing itself is not under test
//! Assertions on wall-clock durations use generous margins; assertions on
//! event ORDER are exact, since ordering is deterministic by design.

#[cfg(test)]
mod tests {
    use crate::clock::{Clock, ForkOptions, MasterConfig};
    use crate::tempo::{DurationUnits, TempoEnvelope};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    /// Shared append-only event log for cross-thread order assertions.
    #[derive(Clone, Default)]
    struct EventLog(Arc<Mutex<Vec<String>>>);

    impl EventLog {
        fn push(&self, event: impl Into<String>) {
            self.0.lock().unwrap().push(event.into());
        }

        fn events(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn fast_master(rate: f64) -> Clock {
        init_logging();
        Clock::master_with(MasterConfig {
            name: "master".into(),
            initial_rate: rate,
            seed: Some(1),
        })
        .unwrap()
    }

    #[test]
    fn test_sequential_waits_accumulate_beats() {
        let mut master = fast_master(50.0);
        let mut last_time = master.time();
        for _ in 0..3 {
            master.wait(1.0).unwrap();
            let now = master.time();
            assert!(now >= last_time, "time went backwards: {last_time} -> {now}");
            last_time = now;
        }
        // live beat is at least the cursor; at 50 beats/sec the overshoot
        // from scheduling latency stays well under a beat
        let beat = master.beat();
        assert!(beat >= 3.0, "beat {beat} fell short of 3");
        assert!(beat < 4.0, "beat {beat} overshot by more than a beat");
        let time = master.time();
        assert!((time - 3.0 / 50.0).abs() < 0.03, "time was {time}");
    }

    #[test]
    fn test_sibling_rates_one_and_three() {
        let log = EventLog::default();
        let mut master = fast_master(1.0);
        master.fast_forward().unwrap();

        let beats = Arc::new(Mutex::new((0.0f64, 0.0f64)));

        let log_a = log.clone();
        let beats_a = Arc::clone(&beats);
        master
            .fork_with(
                ForkOptions {
                    name: Some("a".into()),
                    initial_rate: 1.0,
                },
                move |clock| {
                    clock.wait(1.0)?;
                    log_a.push("a");
                    beats_a.lock().unwrap().0 = clock.beat();
                    Ok(())
                },
            )
            .unwrap();
        let log_b = log.clone();
        let beats_b = Arc::clone(&beats);
        master
            .fork_with(
                ForkOptions {
                    name: Some("b".into()),
                    initial_rate: 3.0,
                },
                move |clock| {
                    clock.wait(3.0)?;
                    log_b.push("b");
                    beats_b.lock().unwrap().1 = clock.beat();
                    Ok(())
                },
            )
            .unwrap();
        master.wait_for_children_to_finish().unwrap();

        // both wake at master beat 1; fork order breaks the tie
        assert_eq!(log.events(), vec!["a", "b"]);
        let (beat_a, beat_b) = *beats.lock().unwrap();
        assert!((beat_a - 1.0).abs() < 0.1, "clock a woke at beat {beat_a}");
        assert!((beat_b - 3.0).abs() < 0.3, "clock b woke at beat {beat_b}");
        assert!(master.beat() >= 1.0);
    }

    #[test]
    fn test_same_beat_release_follows_fork_order() {
        let log = EventLog::default();
        let mut master = fast_master(1.0);
        master.fast_forward().unwrap();

        for name in ["a", "b", "c"] {
            let log = log.clone();
            master
                .fork_with(
                    ForkOptions {
                        name: Some(name.into()),
                        initial_rate: 1.0,
                    },
                    move |clock| {
                        for round in 0..2 {
                            clock.wait(1.0)?;
                            log.push(format!("{name}{round}"));
                        }
                        Ok(())
                    },
                )
                .unwrap();
        }
        master.wait_for_children_to_finish().unwrap();

        assert_eq!(log.events(), vec!["a0", "b0", "c0", "a1", "b1", "c1"]);
    }

    #[test]
    fn test_kill_stops_subtree() {
        let counter = Arc::new(Mutex::new(0u32));
        let mut master = fast_master(100.0);

        let child = master
            .fork({
                let counter = Arc::clone(&counter);
                move |clock| {
                    loop {
                        clock.wait(1.0)?;
                        *counter.lock().unwrap() += 1;
                    }
                }
            })
            .unwrap();

        master.wait(5.0).unwrap();
        child.kill();
        while !child.is_dead() {
            std::thread::sleep(Duration::from_millis(1));
        }
        let at_kill = *counter.lock().unwrap();
        assert!(at_kill > 0, "child never ran before the kill");

        master.wait(10.0).unwrap();
        assert_eq!(*counter.lock().unwrap(), at_kill);
        master.wait_for_children_to_finish().unwrap();
    }

    #[test]
    fn test_beat_and_time_never_step_back_at_death() {
        let mut master = fast_master(100.0);
        let child = master
            .fork(|clock| {
                loop {
                    clock.wait(1.0)?;
                }
            })
            .unwrap();

        master.wait(3.0).unwrap();
        let live_beat = child.beat();
        let live_time = child.time();
        child.kill();
        while !child.is_dead() {
            std::thread::sleep(Duration::from_millis(1));
        }

        // death pins the position at the instant of the kill, which can
        // only be at or past anything observed while the child was alive
        let dead_beat = child.beat();
        let dead_time = child.time();
        assert!(
            dead_beat >= live_beat,
            "beat stepped back at death: {live_beat} -> {dead_beat}"
        );
        assert!(
            dead_time >= live_time,
            "time stepped back at death: {live_time} -> {dead_time}"
        );

        master.wait(2.0).unwrap();
        assert!((child.beat() - dead_beat).abs() < 1e-12);
        assert!((child.time() - dead_time).abs() < 1e-12);
        master.wait_for_children_to_finish().unwrap();
    }

    #[test]
    fn test_hold_freezes_and_release_resumes() {
        let mut master = fast_master(20.0);
        let child = master
            .fork(|clock| {
                loop {
                    clock.wait(0.25)?;
                }
            })
            .unwrap();

        master.wait(2.0).unwrap();
        child.rouse_and_hold();
        assert!(child.is_held());
        assert_eq!(child.absolute_rate(), 0.0);

        let frozen_beat = child.beat();
        let frozen_time = child.time();
        master.wait(4.0).unwrap();
        assert!((child.beat() - frozen_beat).abs() < 1e-6);
        assert!((child.time() - frozen_time).abs() < 1e-6);

        child.release_from_suspension();
        assert!(!child.is_held());
        master.wait(4.0).unwrap();
        assert!(
            child.beat() > frozen_beat + 1.0,
            "beat {} never moved past {}",
            child.beat(),
            frozen_beat
        );

        child.kill();
        master.wait_for_children_to_finish().unwrap();
    }

    #[test]
    fn test_retempo_mid_wait_shortens_sleep() {
        let mut master = fast_master(10.0);
        let start = Instant::now();

        // 10 child beats at rate 1 is 10 master beats, a full second of
        // wall time at this master rate
        let child = master
            .fork(|clock| clock.wait(10.0))
            .unwrap();

        master.wait(1.0).unwrap();
        child.set_rate(100.0).unwrap();
        master.wait_for_children_to_finish().unwrap();

        // the remaining ~9 child beats collapse to ~0.09 master beats
        let elapsed = start.elapsed().as_secs_f64();
        assert!(elapsed < 0.6, "retempo did not retime the sleep ({elapsed}s)");
        assert!(child.is_dead());
    }

    #[test]
    fn test_fast_forward_skips_wall_time() {
        let mut master = fast_master(1.0);
        let start = Instant::now();
        master.fast_forward().unwrap();
        assert!(master.is_fast_forwarding());

        master
            .fork(|clock| {
                for _ in 0..30 {
                    clock.wait(1.0)?;
                }
                Ok(())
            })
            .unwrap();
        master.wait_for_children_to_finish().unwrap();
        master.wait(30.0).unwrap();

        assert!(master.time() >= 60.0 - 1e-6);
        assert!(
            start.elapsed().as_secs_f64() < 2.0,
            "60 logical seconds took {:?} of wall time",
            start.elapsed()
        );
    }

    #[test]
    fn test_fast_forward_window_then_real_time() {
        let mut master = fast_master(1.0);
        let start = Instant::now();

        master.fast_forward_in_time(0.5).unwrap();
        master.wait(0.4).unwrap();
        assert!(master.is_fast_forwarding());
        assert!(start.elapsed().as_secs_f64() < 0.2);

        // 0.1s of this wait is still inside the window, 0.1s is real
        master.wait(0.2).unwrap();
        assert!(!master.is_fast_forwarding());
        let elapsed = start.elapsed().as_secs_f64();
        assert!(elapsed >= 0.05, "second wait came back too fast ({elapsed}s)");
        assert!(elapsed < 0.5, "second wait overslept ({elapsed}s)");
        assert!((master.time() - 0.6).abs() < 0.1);
    }

    #[test]
    fn test_tempo_glide_integrates_beat_lengths() {
        let mut master = fast_master(1.0);
        master.fast_forward().unwrap();

        // beat length slides 1.0 -> 0.5 linearly over 4 beats, so those
        // beats take the average length, 3 seconds in all
        master
            .set_beat_length_target(0.5, 4.0, 0.0, DurationUnits::Beats)
            .unwrap();
        master.wait(4.0).unwrap();
        assert!((master.time() - 3.0).abs() < 0.2, "time was {}", master.time());
        assert!((master.beat_length() - 0.5).abs() < 0.05);
    }

    #[test]
    fn test_deterministic_rng_replay() {
        let run = || -> Vec<String> {
            let log = EventLog::default();
            let mut master = Clock::master_with(MasterConfig {
                name: "master".into(),
                initial_rate: 1.0,
                seed: Some(42),
            })
            .unwrap();
            master.fast_forward().unwrap();
            for _ in 0..2 {
                let log = log.clone();
                master
                    .fork(move |clock| {
                        clock.wait(1.0)?;
                        let draw = clock.random();
                        log.push(format!("{}:{:.12}", clock.name(), draw));
                        Ok(())
                    })
                    .unwrap();
            }
            master.wait_for_children_to_finish().unwrap();
            log.events()
        };

        let first = run();
        let second = run();
        assert_eq!(first, second);
        // sibling streams diverge
        assert_ne!(first[0].split(':').nth(1), first[1].split(':').nth(1));
    }

    #[test]
    fn test_trivial_waits_do_not_advance() {
        let mut master = fast_master(1.0);
        master.wait(0.0).unwrap();
        master.wait(-5.0).unwrap();
        master.wait(f64::NAN).unwrap();
        assert!(master.beat() < 0.05);
    }

    #[test]
    fn test_children_are_listed_then_reaped() {
        let mut master = fast_master(50.0);
        let handle = master
            .fork_with(
                ForkOptions {
                    name: Some("worker".into()),
                    initial_rate: 1.0,
                },
                |clock| clock.wait(1.0),
            )
            .unwrap();
        let listed = master.children();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name(), "worker");

        master.wait_for_children_to_finish().unwrap();
        assert!(handle.is_dead());
        assert!(master.children().is_empty());
    }

    #[test]
    fn test_kill_interrupts_blocked_descendants() {
        let log = EventLog::default();
        let mut master = fast_master(100.0);

        let log_outer = log.clone();
        let child = master
            .fork(move |clock| {
                let log_inner = log_outer.clone();
                clock
                    .fork(move |grandchild| {
                        let result = grandchild.wait(1_000_000.0);
                        log_inner.push(format!("grandchild: {result:?}"));
                        result
                    })
                    .expect("fork grandchild");
                let result = clock.wait(1_000_000.0);
                log_outer.push(format!("child: {result:?}"));
                result
            })
            .unwrap();

        master.wait(5.0).unwrap();
        child.kill();
        master.wait_for_children_to_finish().unwrap();

        // the grandchild's thread is not joined by the master; give it a
        // moment to reach its log line
        let deadline = Instant::now() + Duration::from_secs(2);
        while log.events().len() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        let mut events = log.events();
        events.sort();
        assert_eq!(
            events,
            vec!["child: Err(Interrupted)", "grandchild: Err(Interrupted)"]
        );
    }

    #[test]
    fn test_absolute_rate_multiplies_down_the_chain() {
        let observed = Arc::new(Mutex::new(0.0f64));
        let mut master = fast_master(4.0);
        master
            .fork_with(
                ForkOptions {
                    name: None,
                    initial_rate: 2.0,
                },
                {
                    let observed = Arc::clone(&observed);
                    move |clock| {
                        *observed.lock().unwrap() = clock.absolute_rate();
                        clock.wait(0.0)
                    }
                },
            )
            .unwrap();
        master.wait_for_children_to_finish().unwrap();
        assert!((*observed.lock().unwrap() - 8.0).abs() < 1e-6);
    }

    #[test]
    fn test_time_in_master_agrees_across_tree() {
        let mut master = fast_master(8.0);
        master.fast_forward().unwrap();
        let child = master
            .fork(|clock| {
                for _ in 0..4 {
                    clock.wait(1.0)?;
                }
                Ok(())
            })
            .unwrap();
        master.wait(2.0).unwrap();
        let via_child = child.time_in_master();
        let via_master = master.time();
        assert!((via_child - via_master).abs() < 0.05);
        master.wait_for_children_to_finish().unwrap();
    }

    #[test]
    fn test_extract_absolute_tempo_envelope_constant_chain() {
        let mut master = fast_master(2.0);
        master.fast_forward().unwrap();
        let child = master
            .fork_with(
                ForkOptions {
                    name: None,
                    initial_rate: 2.0,
                },
                |clock| clock.wait(4.0),
            )
            .unwrap();
        master.wait_for_children_to_finish().unwrap();

        // child beat length 0.5 parent beats, master beat length 0.5
        // seconds, so one child beat costs 0.25 seconds of master time
        let env = child
            .extract_absolute_tempo_envelope(0.0, 0.5, 1e-9)
            .unwrap();
        assert!((env.beat_length_at(1.0) - 0.25).abs() < 1e-9);
        assert!((env.beat_length_at(3.5) - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_extract_absolute_tempo_envelope_tracks_parent_change() {
        let mut master = fast_master(1.0);
        master.fast_forward().unwrap();
        let child = master
            .fork(|clock| {
                clock.wait(2.0)?;
                clock.wait(2.0)
            })
            .unwrap();
        master.wait(2.0).unwrap();
        master.set_rate(4.0).unwrap();
        master.wait_for_children_to_finish().unwrap();

        let env = child
            .extract_absolute_tempo_envelope(0.0, 0.25, 1e-9)
            .unwrap();
        // child beats track the master one-to-one, so the extraction sees
        // the master's own beat lengths before and after the change
        assert!((env.beat_length_at(1.0) - 1.0).abs() < 1e-6);
        assert!((env.beat_length_at(3.5) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_apply_tempo_envelope_takes_effect() {
        let mut master = fast_master(1.0);
        master.fast_forward().unwrap();
        // 1 beat at length 0.2, then settle at length 0.1
        let curve = TempoEnvelope::from_beat_lengths(&[0.2, 0.1], &[1.0], &[0.0]).unwrap();
        master.apply_tempo_envelope(&curve, Some(0.0)).unwrap();
        master.wait(3.0).unwrap();
        // 0.15 average for the first beat, 0.1 for the other two
        assert!((master.time() - 0.35).abs() < 0.05, "time was {}", master.time());
        assert!((master.beat_length() - 0.1).abs() < 1e-6);
    }
}
