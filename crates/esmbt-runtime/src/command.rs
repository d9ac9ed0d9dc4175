use std::io::Read;
use std::process::{Child, Command, Output, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::warn;

const POLL: Duration = Duration::from_millis(50);

/// Put the child in its own process group so a terminal interrupt aimed at
/// esmbt does not reach it. Cancellation is left to the orchestrator.
pub(crate) fn detach(cmd: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }
}

/// A finished collaborator command.
pub(crate) struct Bounded {
    pub output: Output,
    /// The command overran its limit and was killed.
    pub timed_out: bool,
}

/// Run `cmd` detached with captured output, killing it once `limit` elapses.
pub(crate) fn run_bounded(cmd: &mut Command, limit: Duration) -> std::io::Result<Bounded> {
    detach(cmd);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = cmd.spawn()?;
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let deadline = Instant::now() + limit;
    let mut timed_out = false;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            warn!(
                "pid {} exceeded {}s, killing it",
                child.id(),
                limit.as_secs()
            );
            kill_group(&mut child);
            timed_out = true;
            break child.wait()?;
        }
        thread::sleep(POLL);
    };

    Ok(Bounded {
        output: Output {
            status,
            stdout: collect(stdout),
            stderr: collect(stderr),
        },
        timed_out,
    })
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

/// Kill the child together with anything it spawned into its group.
#[cfg(unix)]
fn kill_group(child: &mut Child) {
    if let Ok(pgid) = i32::try_from(child.id()) {
        // SAFETY: kill() on the child's own process group with a constant signal
        // number has no memory-safety preconditions.
        #[allow(unsafe_code)]
        let _ = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    }
    let _ = child.kill();
}

#[cfg(windows)]
fn kill_group(child: &mut Child) {
    let _ = Command::new("taskkill")
        .args(["/F", "/T", "/PID", &child.id().to_string()])
        .output();
    let _ = child.kill();
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn captures_both_streams() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2; exit 4"]);
        let done = run_bounded(&mut cmd, Duration::from_secs(10)).unwrap();
        assert!(!done.timed_out);
        assert_eq!(done.output.status.code(), Some(4));
        assert_eq!(String::from_utf8_lossy(&done.output.stdout), "out\n");
        assert_eq!(String::from_utf8_lossy(&done.output.stderr), "err\n");
    }

    #[test]
    fn overrunning_command_is_killed() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo started; sleep 30"]);
        let started = Instant::now();
        let done = run_bounded(&mut cmd, Duration::from_secs(1)).unwrap();
        assert!(done.timed_out);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(String::from_utf8_lossy(&done.output.stdout), "started\n");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn child_leads_its_own_process_group() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo $$; cut -d' ' -f5 /proc/$$/stat"]);
        let done = run_bounded(&mut cmd, Duration::from_secs(10)).unwrap();
        let text = String::from_utf8_lossy(&done.output.stdout).into_owned();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2, "unexpected output: {text}");
        assert_eq!(lines[0], lines[1], "pid and process group differ");
    }
}
