#![cfg(target_os = "linux")]
//! Bootstrap, fatal paths and exit-time reporting.
//!
//! Cases that end the process run in a re-executed copy of this test binary
//! selected by `MPKGUARD_TEST_CHILD`.

use std::io::Read;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, Output};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use mpkguard::instrument_abi::{__count_allocas, __sfi_exception, get_domain, set_domain_value};
use mpkguard::malloc_abi::{free, malloc};
use mpkguard::runtime_state::{self, Entry};
use mpkguard_membrane::Domain;
use mpkguard_membrane::sink::{RECORD_SIZE, Signal, SignalRecord};

const CHILD_CASE: &str = "MPKGUARD_TEST_CHILD";

fn run_child(case: &str, env: &[(&str, &str)]) -> Output {
    Command::new(std::env::current_exe().expect("test binary path"))
        .args(["--exact", "child_entry", "--nocapture", "--test-threads=1"])
        .env(CHILD_CASE, case)
        .envs(env.iter().copied())
        .output()
        .expect("spawn child")
}

/// Entry point of re-executed children; a no-op in the parent run.
#[test]
fn child_entry() {
    let Ok(case) = std::env::var(CHILD_CASE) else {
        return;
    };
    match case.as_str() {
        "no-domain" => {
            mpkguard::ensure_initialized();
            // A thread that never went through the hook or adoption.
            thread::spawn(|| {
                // SAFETY: the call is expected to abort.
                let _ = unsafe { get_domain() };
            })
            .join()
            .expect("join");
            unreachable!("get_domain without a descriptor must abort");
        }
        "report" => {
            mpkguard::adopt_current_thread(Domain::SAFE).expect("adopt");
            // SAFETY: descriptor installed; blocks freed right away.
            unsafe {
                free(malloc(24));
                set_domain_value(1);
                free(malloc(24));
                set_domain_value(0);
                __count_allocas(3, 1);
                __sfi_exception();
            }
        }
        other => panic!("unknown child case {other}"),
    }
}

#[test]
fn get_domain_without_descriptor_aborts_with_diagnostic() {
    let output = run_child("no-domain", &[("MPKGUARD_REPORT", "off")]);
    assert_eq!(output.status.signal(), Some(libc::SIGABRT));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("mpkguard: fatal: Thread has no domain"),
        "stderr: {stderr}"
    );
}

#[test]
fn text_report_lists_counters_in_order() {
    let output = run_child("report", &[("MPKGUARD_REPORT", "text")]);
    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let labels: Vec<&str> = stdout
        .lines()
        .filter_map(|line| line.split_once(": ").map(|(label, _)| label))
        .filter(|label| !label.starts_with("test "))
        .collect();
    let expected = [
        "Total heap",
        "Unsafe Heap",
        "Total Stack",
        "Unsafe Stack",
        "Total Unsafe Read",
        "Safe Read In Unsafe",
        "Total Unsafe Write",
        "Safe Write In Unsafe",
        "Total Safe Read",
        "Unsafe Read In Safe",
        "Total Safe Write",
        "Unsafe Write In Safe",
        "SFI Exceptions",
    ];
    assert!(
        labels.ends_with(&expected),
        "unexpected report layout: {stdout}"
    );
    assert!(stdout.contains("Total heap: 2\n"), "{stdout}");
    assert!(stdout.contains("Unsafe Heap: 1\n"), "{stdout}");
    assert!(stdout.contains("Unsafe Stack: 1\n"), "{stdout}");
    assert!(stdout.contains("SFI Exceptions: 1\n"), "{stdout}");
}

#[test]
fn json_report_is_one_parseable_line() {
    let output = run_child("report", &[("MPKGUARD_REPORT", "json")]);
    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let line = stdout
        .lines()
        .rev()
        .find(|line| line.starts_with('{'))
        .expect("json report line");
    let report: serde_json::Value = serde_json::from_str(line).expect("valid json");
    assert_eq!(report["total_heap"], 2);
    assert_eq!(report["unsafe_heap"], 1);
    assert_eq!(report["total_allocas"], 3);
    assert_eq!(report["sfi_exceptions"], 1);
}

#[test]
fn sink_receives_begin_counters_and_end_records() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let SocketAddr::V4(addr) = listener.local_addr().expect("addr") else {
        unreachable!("bound to ipv4");
    };
    let reader = thread::spawn(move || {
        let (mut conn, _) = listener.accept().expect("accept");
        let mut raw = Vec::new();
        conn.read_to_end(&mut raw).expect("read");
        raw
    });

    let endpoint = addr.to_string();
    let output = run_child(
        "report",
        &[("MPKGUARD_REPORT", "off"), ("MPKGUARD_SINK", &endpoint)],
    );
    assert!(output.status.success(), "{output:?}");

    let raw = reader.join().expect("reader");
    let records: Vec<SignalRecord> = raw
        .chunks_exact(RECORD_SIZE)
        .map(|chunk| SignalRecord::from_bytes(chunk.try_into().expect("record")))
        .collect();
    assert_eq!(records.first(), Some(&SignalRecord::new(Signal::BeginExecution, 0)));
    assert_eq!(records.last(), Some(&SignalRecord::new(Signal::EndExecution, 0)));
    assert!(records.contains(&SignalRecord::new(Signal::TotalHeapAlloc, 2)));
    assert!(records.contains(&SignalRecord::new(Signal::UnsafeHeapAlloc, 1)));
}

#[test]
fn ensure_initialized_is_idempotent_across_threads() {
    const THREADS: usize = 8;
    const CALLS: usize = 1_000;
    let seen = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let seen = Arc::clone(&seen);
            thread::spawn(move || {
                for _ in 0..CALLS {
                    mpkguard::ensure_initialized();
                    let Entry::Ready(runtime) = runtime_state::enter() else {
                        panic!("only bootstrap itself may observe the bootstrapping state");
                    };
                    let addr = runtime as *const _ as usize;
                    let prev = seen.compare_exchange(0, addr, Ordering::AcqRel, Ordering::Acquire);
                    if let Err(existing) = prev {
                        assert_eq!(existing, addr);
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("join");
    }
    assert!(mpkguard::is_initialized());
}
