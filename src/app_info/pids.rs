// SPDX-License-Identifier: GPL-3.0-only

//! Translation of process and thread ids between pid namespaces.

use std::ffi::OsStr;

use procfs::process::{all_processes, Process};

use super::IdentityError;

pub fn process(pid: u32) -> Result<Process, IdentityError> {
    let pid = i32::try_from(pid).map_err(|_| IdentityError::PidMapping(format!("invalid pid {pid}")))?;
    Ok(Process::new(pid)?)
}

/// Inode of the pid namespace `process` lives in.
pub fn pidns_of(process: &Process) -> Result<u64, IdentityError> {
    process
        .namespaces()?
        .0
        .get(OsStr::new("pid"))
        .map(|namespace| namespace.identifier)
        .ok_or_else(|| IdentityError::PidMapping(format!("no pid namespace for process {}", process.pid())))
}

/// Host id of a process or thread along with its `NSpid` list, outermost
/// namespace first.
pub type Candidate = (u32, Option<Vec<i32>>);

/// Picks, for every id in `ids`, the candidate whose innermost namespace id
/// matches. Every id has to be found.
pub fn match_ids(candidates: impl IntoIterator<Item = Candidate>, ids: &[u32]) -> Result<Vec<u32>, IdentityError> {
    let mut mapped = vec![None; ids.len()];
    for (outer, nspid) in candidates {
        let Some(inner) = nspid.as_deref().and_then(<[i32]>::last) else {
            continue;
        };
        for (slot, wanted) in mapped.iter_mut().zip(ids) {
            if slot.is_none() && i64::from(*wanted) == i64::from(*inner) {
                *slot = Some(outer);
            }
        }
        if mapped.iter().all(Option::is_some) {
            break;
        }
    }

    mapped
        .into_iter()
        .zip(ids)
        .map(|(slot, id)| slot.ok_or_else(|| IdentityError::PidMapping(format!("id {id} not found in namespace"))))
        .collect()
}

/// Maps ids as seen inside namespace `pidns` to ids in our own namespace.
///
/// `tasks_of` selects the threads of that host process instead of all
/// processes.
pub fn map_ids(pidns: u64, ids: &[u32], tasks_of: Option<u32>) -> Result<Vec<u32>, IdentityError> {
    match tasks_of {
        Some(owner) => {
            let owner_process = process(owner)?;
            if pidns_of(&owner_process)? != pidns {
                return Err(IdentityError::PidMapping(format!(
                    "process {owner} is not part of the caller's pid namespace"
                )));
            }
            let candidates = owner_process.tasks()?.filter_map(Result::ok).filter_map(|task| {
                let tid = u32::try_from(task.tid).ok()?;
                Some((tid, task.status().ok().and_then(|status| status.nspid)))
            });
            match_ids(candidates, ids)
        }
        None => {
            let candidates = all_processes()?
                .filter_map(Result::ok)
                .filter(|process| pidns_of(process).is_ok_and(|ns| ns == pidns))
                .filter_map(|process| {
                    let pid = u32::try_from(process.pid()).ok()?;
                    Some((pid, process.status().ok().and_then(|status| status.nspid)))
                });
            match_ids(candidates, ids)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_match_innermost_id() {
        let candidates = vec![
            (4321, Some(vec![4321, 12, 2])),
            (4400, Some(vec![4400, 80, 7])),
            (1, None),
        ];
        assert_eq!(match_ids(candidates.clone(), &[7, 2]).unwrap(), vec![4400, 4321]);
        assert!(match_ids(candidates, &[12]).is_err());
    }

    #[test]
    fn test_map_own_pid() {
        let pid = std::process::id();
        let ns = pidns_of(&process(pid).unwrap()).unwrap();
        assert_eq!(map_ids(ns, &[pid], None).unwrap(), vec![pid]);
    }

    #[test]
    fn test_unknown_pid_fails() {
        let pid = std::process::id();
        let ns = pidns_of(&process(pid).unwrap()).unwrap();
        assert!(map_ids(ns, &[u32::MAX - 1], None).is_err());
    }
}
