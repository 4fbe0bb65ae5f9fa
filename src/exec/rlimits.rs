/// Scoped resource ceilings.
///
/// `ResourceLimiter` lowers the soft CPU, address-space, and stack rlimits
/// for the duration of one execution and restores the saved values on every
/// exit path, including panics, via `Drop`. Hard limits are left untouched
/// so the restore is always permitted.
use crate::config::policy::ExecutionPolicy;
use crate::config::types::{Result, SandboxError};

#[derive(Clone, Copy, Debug)]
struct SavedLimit {
    resource: libc::__rlimit_resource_t,
    name: &'static str,
    soft: libc::rlim_t,
    hard: libc::rlim_t,
}

fn get_rlimit(resource: libc::__rlimit_resource_t, name: &'static str) -> Result<SavedLimit> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let rc = unsafe { libc::getrlimit(resource, &mut limit) };
    if rc != 0 {
        return Err(SandboxError::ResourceLimit(format!(
            "getrlimit({name}) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(SavedLimit {
        resource,
        name,
        soft: limit.rlim_cur,
        hard: limit.rlim_max,
    })
}

fn set_soft_limit(saved: &SavedLimit, soft: libc::rlim_t) -> Result<()> {
    let limit = libc::rlimit {
        rlim_cur: soft.min(saved.hard),
        rlim_max: saved.hard,
    };
    let rc = unsafe { libc::setrlimit(saved.resource, &limit) };
    if rc != 0 {
        return Err(SandboxError::ResourceLimit(format!(
            "setrlimit({}={}) failed: {}",
            saved.name,
            soft,
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Which ceilings to apply. The fallback in-process mode leaves CPU alone:
/// `RLIMIT_CPU` is process-wide and SIGXCPU would take down the embedding
/// service, so time there is bounded by the wall-clock race instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimitScope {
    /// CPU, address space, and stack (dedicated runner process).
    Full,
    /// Address space and stack only (shared host process).
    MemoryOnly,
}

/// RAII guard over per-execution rlimits.
#[derive(Debug)]
pub struct ResourceLimiter {
    saved: Vec<SavedLimit>,
}

impl ResourceLimiter {
    /// Capture the current soft ceilings and lower them to the policy
    /// values. Fails without partial application: any saved limit is
    /// restored before the error is returned.
    pub fn apply(policy: &ExecutionPolicy, scope: LimitScope) -> Result<Self> {
        let mut plan: Vec<(libc::__rlimit_resource_t, &'static str, libc::rlim_t)> = vec![
            (
                libc::RLIMIT_AS,
                "RLIMIT_AS",
                policy.memory_limit as libc::rlim_t,
            ),
            (
                libc::RLIMIT_STACK,
                "RLIMIT_STACK",
                policy.stack_limit as libc::rlim_t,
            ),
        ];
        if scope == LimitScope::Full {
            plan.push((
                libc::RLIMIT_CPU,
                "RLIMIT_CPU",
                policy.cpu_time_limit.as_secs().max(1) as libc::rlim_t,
            ));
        }

        let mut limiter = ResourceLimiter { saved: Vec::new() };
        for (resource, name, soft) in plan {
            let saved = get_rlimit(resource, name)?;
            set_soft_limit(&saved, soft)?;
            limiter.saved.push(saved);
        }
        Ok(limiter)
    }
}

impl Drop for ResourceLimiter {
    fn drop(&mut self) {
        // Restore in reverse order of application.
        for saved in self.saved.iter().rev() {
            if let Err(err) = set_soft_limit(saved, saved.soft) {
                log::warn!("failed to restore {}: {}", saved.name, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Rlimits are process-wide; serialize these tests against each other.
    static RLIMIT_TEST_LOCK: Mutex<()> = Mutex::new(());

    /// Ceilings roomy enough that concurrently running tests in this
    /// binary never hit them while a guard is live.
    fn roomy_policy() -> ExecutionPolicy {
        ExecutionPolicy {
            memory_limit: 4 * 1024 * 1024 * 1024,
            ..ExecutionPolicy::default()
        }
    }

    fn current_limit(resource: libc::__rlimit_resource_t) -> libc::rlimit {
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        assert_eq!(unsafe { libc::getrlimit(resource, &mut limit) }, 0);
        limit
    }

    #[test]
    fn limits_are_restored_on_drop() {
        let _lock = RLIMIT_TEST_LOCK.lock().unwrap();
        let before = current_limit(libc::RLIMIT_AS);

        let policy = roomy_policy();
        {
            let _guard = ResourceLimiter::apply(&policy, LimitScope::MemoryOnly)
                .expect("failed to apply limits");
            let expected = (policy.memory_limit as libc::rlim_t).min(before.rlim_max);
            assert_eq!(current_limit(libc::RLIMIT_AS).rlim_cur, expected);
            // Hard ceiling untouched, so restore stays possible.
            assert_eq!(current_limit(libc::RLIMIT_AS).rlim_max, before.rlim_max);
        }

        assert_eq!(current_limit(libc::RLIMIT_AS).rlim_cur, before.rlim_cur);
    }

    #[test]
    fn limits_are_restored_after_panic() {
        let _lock = RLIMIT_TEST_LOCK.lock().unwrap();
        let before = current_limit(libc::RLIMIT_STACK);

        let policy = roomy_policy();
        let result = std::panic::catch_unwind(|| {
            let _guard = ResourceLimiter::apply(&policy, LimitScope::MemoryOnly)
                .expect("failed to apply limits");
            panic!("forced unwind");
        });
        assert!(result.is_err());

        assert_eq!(current_limit(libc::RLIMIT_STACK).rlim_cur, before.rlim_cur);
    }

    #[test]
    fn memory_only_scope_leaves_cpu_alone() {
        let _lock = RLIMIT_TEST_LOCK.lock().unwrap();
        let before = current_limit(libc::RLIMIT_CPU);

        let policy = roomy_policy();
        {
            let _guard = ResourceLimiter::apply(&policy, LimitScope::MemoryOnly)
                .expect("failed to apply limits");
            assert_eq!(current_limit(libc::RLIMIT_CPU).rlim_cur, before.rlim_cur);
        }
        assert_eq!(current_limit(libc::RLIMIT_CPU).rlim_cur, before.rlim_cur);
    }
}
