use kernel_info::ids::Pid;
use kernel_sched::{
    CpuId, NodeId, SchedClass, SchedConfig, Scheduler, ThreadId, TickOutcome,
};
use std::collections::HashMap;

/// Run every CPU for `rounds` ticks, preempting on quantum expiry, and
/// count the ticks each thread received.
fn run(sched: &Scheduler, rounds: usize) -> HashMap<ThreadId, u32> {
    let cpus: CpuId = sched.config().cpus;
    let mut got = HashMap::new();
    for _ in 0..rounds {
        for cpu in 0..cpus {
            let running = match sched.current(cpu).unwrap() {
                Some(t) => Some(t),
                None => sched.dispatch(cpu).unwrap(),
            };
            let outcome = sched.tick(cpu).unwrap();
            if let Some(t) = running {
                *got.entry(t).or_insert(0) += 1;
                if outcome == TickOutcome::Reschedule {
                    sched.preempt(cpu).unwrap();
                }
            }
        }
    }
    got
}

fn within(value: u32, expected: u32, tolerance: u32) -> bool {
    value.abs_diff(expected) <= tolerance
}

#[test]
fn sibling_weights_split_time_one_to_four() {
    let sched: Scheduler = Scheduler::new(SchedConfig::default());
    let light = sched.create_group(NodeId::ROOT, 5).unwrap();
    let heavy = sched.create_group(NodeId::ROOT, 20).unwrap();
    let a = sched.spawn(Pid(1), light, 10, SchedClass::Timeshare).unwrap();
    let b = sched.spawn(Pid(2), heavy, 10, SchedClass::Timeshare).unwrap();

    let got = run(&sched, 1000);
    assert_eq!(got[&a] + got[&b], 1000);
    assert!(within(got[&a], 200, 20), "light group got {}", got[&a]);
    assert!(within(got[&b], 800, 20), "heavy group got {}", got[&b]);
}

#[test]
fn group_share_does_not_depend_on_thread_count() {
    let sched: Scheduler = Scheduler::new(SchedConfig::default());
    let crowded = sched.create_group(NodeId::ROOT, 10).unwrap();
    let single = sched.create_group(NodeId::ROOT, 10).unwrap();
    let many: Vec<_> = (0..4)
        .map(|_| sched.spawn(Pid(1), crowded, 10, SchedClass::Timeshare).unwrap())
        .collect();
    let alone = sched.spawn(Pid(2), single, 10, SchedClass::Timeshare).unwrap();

    let got = run(&sched, 2000);
    assert!(within(got[&alone], 1000, 20), "single thread got {}", got[&alone]);
    for t in many {
        assert!(within(got[&t], 250, 20), "{t} got {}", got[&t]);
    }
}

#[test]
fn equal_threads_share_two_cpus() {
    let sched: Scheduler = Scheduler::new(SchedConfig {
        cpus: 2,
        ..SchedConfig::default()
    });
    let threads: Vec<_> = (0..3)
        .map(|i| sched.spawn(Pid(i), NodeId::ROOT, 10, SchedClass::Timeshare).unwrap())
        .collect();

    let got = run(&sched, 750);
    for t in threads {
        assert!(within(got[&t], 500, 20), "{t} got {}", got[&t]);
    }
}

#[test]
fn reweighting_changes_future_shares() {
    let sched: Scheduler = Scheduler::new(SchedConfig::default());
    let a = sched.spawn(Pid(1), NodeId::ROOT, 10, SchedClass::Timeshare).unwrap();
    let b = sched.spawn(Pid(1), NodeId::ROOT, 10, SchedClass::Timeshare).unwrap();
    let before = run(&sched, 400);
    assert!(within(before[&a], 200, 10));

    sched.set_weight(b, 30).unwrap();
    assert_eq!(sched.weight(b), Ok(30));
    let after = run(&sched, 800);
    assert!(within(after[&b], 600, 30), "reweighted thread got {}", after[&b]);
}
