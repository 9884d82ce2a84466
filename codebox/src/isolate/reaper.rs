//! Process tree teardown.
//!
//! A snippet can leave the worker's process group with `setsid` and outlive
//! the process that forked it. The worker is made a child subreaper before it
//! execs, so orphans are re-parented onto it rather than onto init and the
//! whole tree stays reachable through `/proc/<pid>/stat` parent links. The tree
//! is frozen with SIGSTOP before anything is killed so nothing can fork or
//! reap while it is being walked.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Rounds spent waiting for the tree to stop growing.
const MAX_FREEZE_ROUNDS: usize = 50;
const FREEZE_POLL: Duration = Duration::from_millis(2);

/// Parent pid and one-letter state from the contents of `/proc/<pid>/stat`.
/// The command name may itself contain spaces and parentheses, so fields are
/// counted from the last `)`.
pub(crate) fn parse_stat(raw: &str) -> Option<(i32, char)> {
    let rest = &raw[raw.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let ppid = fields.next()?.parse().ok()?;
    Some((ppid, state))
}

pub(crate) fn process_stat(pid: i32) -> Option<(i32, char)> {
    let raw = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    parse_stat(&raw)
}

/// Every process below `root` that has not exited yet, with its state.
pub(crate) fn descendants(root: i32) -> Vec<(i32, char)> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    let mut children: HashMap<i32, Vec<(i32, char)>> = HashMap::new();
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<i32>().ok())
        else {
            continue;
        };
        if let Some((ppid, state)) = process_stat(pid) {
            if state != 'Z' && state != 'X' {
                children.entry(ppid).or_default().push((pid, state));
            }
        }
    }

    let mut found = Vec::new();
    let mut queue = vec![root];
    while let Some(parent) = queue.pop() {
        if let Some(kids) = children.remove(&parent) {
            queue.extend(kids.iter().map(|(pid, _)| *pid));
            found.extend(kids);
        }
    }
    found
}

fn signal(pid: i32, sig: libc::c_int) {
    // ESRCH just means it is already gone.
    unsafe {
        libc::kill(pid, sig);
    }
}

/// SIGKILL `root` and everything it spawned, wherever it moved to.
pub async fn kill_tree(root: u32) {
    let root = root as i32;
    signal(root, libc::SIGSTOP);

    let mut stopped = HashSet::new();
    for _ in 0..MAX_FREEZE_ROUNDS {
        let tree = descendants(root);
        let mut settled = true;
        for (pid, state) in tree {
            if stopped.insert(pid) {
                signal(pid, libc::SIGSTOP);
                settled = false;
            } else if state != 'T' && state != 't' {
                settled = false;
            }
        }
        if settled {
            break;
        }
        tokio::time::sleep(FREEZE_POLL).await;
    }

    let tree = descendants(root);
    tracing::debug!(root, processes = tree.len(), "Killing worker tree");
    for (pid, _) in tree {
        signal(pid, libc::SIGKILL);
    }
    unsafe {
        libc::killpg(root, libc::SIGKILL);
    }
    signal(root, libc::SIGKILL);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stat_handles_odd_command_names() {
        let raw = "4242 (python3 (x) y) S 4200 4242 4242 0 -1 4194560 123";
        assert_eq!(parse_stat(raw), Some((4200, 'S')));
        assert_eq!(parse_stat("1 (init) Z 0 1 1"), Some((0, 'Z')));
        assert_eq!(parse_stat("garbage"), None);
    }

    #[test]
    fn test_descendants_of_self_include_spawned_child() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let me = std::process::id() as i32;
        let found = descendants(me);
        let _ = child.kill();
        let _ = child.wait();
        assert!(found.iter().any(|(pid, _)| *pid == child.id() as i32));
    }
}
