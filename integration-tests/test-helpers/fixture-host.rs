// Copyright (c) The nextest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A scriptable test host.
//!
//! Speaks the hostguard protocol on stdin and stdout, and runs the fake tests described in
//! `FIXTURE_HOST_TESTS`. See `integration_tests::fixture` for the format.

use camino::Utf8PathBuf;
use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use hostguard_metadata::{ControlMessage, HostMessage, TestOutcome, TestUid, TestUpdate, host_env};
use integration_tests::fixture::{
    Behavior, CHILDREN_ENV, CRASH_EXIT_CODE, FAILURE_EXIT_CODE, FixtureTest, SLEEP_CHILD_ARG,
    STARTED_FILE, TEST_DELAY_ENV, TESTS_ENV, parse_tests,
};
use std::{
    io::{BufRead, Write},
    process::{Command, Stdio},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

fn main() -> Result<()> {
    color_eyre::install()?;

    let mut args = std::env::args().skip(1);
    let mut results_dir = None;
    let mut filter = Vec::new();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            SLEEP_CHILD_ARG => sleep_forever(),
            host_env::RESULTS_DIRECTORY_ARG => results_dir = args.next().map(Utf8PathBuf::from),
            host_env::FILTER_UID_ARG => filter.extend(args.next()),
            other => bail!("[fixture-host] unknown argument `{other}`"),
        }
    }

    let attempt: usize = env_or(host_env::ATTEMPT, 1)?;
    let children: usize = env_or(CHILDREN_ENV, 0)?;
    let delay = Duration::from_millis(env_or(TEST_DELAY_ENV, 0)?);
    let mut tests = parse_tests(&std::env::var(TESTS_ENV).unwrap_or_default())?;
    if !filter.is_empty() {
        tests.retain(|test| filter.contains(&test.uid));
    }

    if let Some(dir) = &results_dir {
        fs_err::write(dir.join(STARTED_FILE), attempt.to_string())?;
    }

    let exe = std::env::current_exe().wrap_err("failed to get current exe")?;
    for _ in 0..children {
        Command::new(&exe)
            .arg(SLEEP_CHILD_ARG)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .wrap_err("failed to spawn child process")?;
    }

    let stop_requested = Arc::new(AtomicBool::new(false));
    {
        let stop_requested = stop_requested.clone();
        std::thread::spawn(move || watch_stdin(&stop_requested));
    }

    println!("[fixture-host] running {} tests (attempt {attempt})", tests.len());

    let mut any_failed = false;
    let mut any_hung = false;
    for test in &tests {
        if stop_requested.load(Ordering::SeqCst) {
            break;
        }
        send_update(test, TestOutcome::InProgress);
        std::thread::sleep(delay);
        match test.behavior {
            Behavior::Hang => any_hung = true,
            Behavior::Crash => {
                eprintln!("[fixture-host] {} crashed the host", test.uid);
                std::process::exit(CRASH_EXIT_CODE);
            }
            behavior if behavior.passes_on(attempt) => send_update(test, TestOutcome::Passed),
            _ => {
                any_failed = true;
                send_update(test, TestOutcome::Failed);
            }
        }
    }

    if any_hung {
        sleep_forever();
    }

    send(&HostMessage::SessionCompleted);
    std::process::exit(if any_failed { FAILURE_EXIT_CODE } else { 0 })
}

fn watch_stdin(stop_requested: &AtomicBool) {
    for line in std::io::stdin().lock().lines() {
        let Ok(line) = line else {
            return;
        };
        if let Ok(ControlMessage::StopRequest { reason }) = ControlMessage::from_line(&line) {
            eprintln!("[fixture-host] stop requested: {reason}");
            stop_requested.store(true, Ordering::SeqCst);
            send(&HostMessage::StopAcknowledged);
        }
    }
}

fn send_update(test: &FixtureTest, outcome: TestOutcome) {
    send(&HostMessage::TestUpdate(TestUpdate {
        uid: TestUid::new(&test.uid),
        display_name: test.display_name().to_owned(),
        outcome,
        timestamp: chrono::Local::now().fixed_offset(),
    }));
}

fn send(message: &HostMessage) {
    let mut stdout = std::io::stdout().lock();
    // The supervisor may already be gone.
    let _ = stdout.write_all(message.to_line().as_bytes());
    let _ = stdout.flush();
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .wrap_err_with(|| format!("invalid value for {name}: `{value}`")),
        Err(_) => Ok(default),
    }
}

fn sleep_forever() -> ! {
    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}
