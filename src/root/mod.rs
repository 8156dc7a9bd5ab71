//! Privilege routing between a local and a privileged-remote implementation.
//!
//! Every operation is dispatched by an explicit strategy value instead of
//! exception-driven retry: the routing combinators are plain functions over
//! two closures, so the policy is testable without touching I/O. The
//! privileged side is reached through the long-lived broker in [`broker`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::{Backend, CopyOptions, FileAttributes, FsError, ReadStream};
use crate::path::VfsPath;
use crate::watch::{ChangeListener, WatchHandle};

pub mod broker;

// ============================================================================
// Strategy
// ============================================================================

/// Per-path policy governing whether privileged execution is tried,
/// preferred, or forbidden.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootStrategy {
    /// Always invoke the local implementation.
    Never,
    /// Try local first; converge to privileged after the first successful
    /// privileged fallback.
    PreferNo,
    /// Try privileged first; fall back to local on channel failure.
    PreferYes,
    /// Always invoke the privileged implementation.
    Always,
}

/// Mutable strategy holder with monotonic transitions: `PreferNo` may flip
/// to `PreferYes` once, `Never` and `Always` never move.
pub struct StrategyCell {
    value: AtomicU8,
}

impl StrategyCell {
    pub fn new(strategy: RootStrategy) -> Self {
        Self {
            value: AtomicU8::new(strategy as u8),
        }
    }

    pub fn get(&self) -> RootStrategy {
        match self.value.load(Ordering::Acquire) {
            0 => RootStrategy::Never,
            1 => RootStrategy::PreferNo,
            2 => RootStrategy::PreferYes,
            _ => RootStrategy::Always,
        }
    }

    /// Records that a privileged fallback succeeded for this path.
    pub fn prefer_root_now(&self) {
        let _ = self.value.compare_exchange(
            RootStrategy::PreferNo as u8,
            RootStrategy::PreferYes as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

/// Answers whether privileged execution is currently available at all
/// (permission granted, helper configured). Consulted before the broker is
/// ever touched.
pub trait PrivilegeSource: Send + Sync {
    fn can_escalate(&self) -> bool;
}

/// Privilege probe backed by the broker configuration.
pub struct ConfiguredPrivileges {
    broker_configured: bool,
}

impl ConfiguredPrivileges {
    pub fn new(config: &crate::config::FsConfig) -> Self {
        Self {
            broker_configured: !config.broker_command.is_empty(),
        }
    }
}

impl PrivilegeSource for ConfiguredPrivileges {
    fn can_escalate(&self) -> bool {
        self.broker_configured
    }
}

/// True when this process already runs with elevated rights, making the
/// broker detour pointless.
#[cfg(unix)]
pub fn process_is_privileged() -> bool {
    // geteuid never fails.
    unsafe { libc::geteuid() == 0 }
}

// ============================================================================
// Routing combinators
// ============================================================================

/// Routes a single-path operation between `local` and `privileged`
/// according to the path's strategy.
///
/// `PreferNo` retries an access-denied local attempt once through the
/// privileged path; on privileged success the cell converges to
/// `PreferYes`, so later calls skip the local attempt. A second failure is
/// surfaced as-is.
pub fn route_single<T>(
    cell: &StrategyCell,
    can_escalate: bool,
    local: impl Fn() -> Result<T, FsError>,
    privileged: impl Fn() -> Result<T, FsError>,
) -> Result<T, FsError> {
    if !can_escalate {
        return local();
    }
    match cell.get() {
        RootStrategy::Never => local(),
        RootStrategy::Always => privileged(),
        RootStrategy::PreferYes => match privileged() {
            Err(e) if e.is_channel_error() => {
                log::debug!("root: privileged channel failed ({}), falling back to local", e);
                local()
            }
            other => other,
        },
        RootStrategy::PreferNo => match local() {
            Err(e) if e.is_access_denied() => {
                log::debug!("root: local attempt denied ({}), retrying privileged", e);
                let value = privileged()?;
                cell.prefer_root_now();
                Ok(value)
            }
            other => other,
        },
    }
}

/// Combines the strategies of a two-path operation (copy/move/link).
///
/// An explicit `Never` on either side forces local, an explicit `Always`
/// forces privileged, and a converged `PreferYes` wins over ambiguity.
pub fn combine_strategies(a: RootStrategy, b: RootStrategy) -> RootStrategy {
    use RootStrategy::*;
    if a == Never || b == Never {
        Never
    } else if a == Always || b == Always {
        Always
    } else if a == PreferYes || b == PreferYes {
        PreferYes
    } else {
        PreferNo
    }
}

/// Routes a two-path operation. Behaves like [`route_single`] over the
/// combined strategy, except that a successful privileged retry does not
/// mutate either cell (it is unknown which side was at fault).
pub fn route_pair<T>(
    a: &StrategyCell,
    b: &StrategyCell,
    can_escalate: bool,
    local: impl Fn() -> Result<T, FsError>,
    privileged: impl Fn() -> Result<T, FsError>,
) -> Result<T, FsError> {
    if !can_escalate {
        return local();
    }
    match combine_strategies(a.get(), b.get()) {
        RootStrategy::Never => local(),
        RootStrategy::Always => privileged(),
        RootStrategy::PreferYes => match privileged() {
            Err(e) if e.is_channel_error() => local(),
            other => other,
        },
        RootStrategy::PreferNo => match local() {
            Err(e) if e.is_access_denied() => privileged(),
            other => other,
        },
    }
}

// ============================================================================
// Rootable backend
// ============================================================================

/// Pairs a local backend with a broker-backed privileged implementation of
/// the same contract, routing every call by the instance's strategy.
pub struct RootableBackend {
    local: Arc<dyn Backend>,
    remote: Arc<dyn Backend>,
    strategy: StrategyCell,
    privileges: Arc<dyn PrivilegeSource>,
    already_privileged: bool,
}

impl RootableBackend {
    pub fn new(
        local: Arc<dyn Backend>,
        remote: Arc<dyn Backend>,
        strategy: RootStrategy,
        privileges: Arc<dyn PrivilegeSource>,
    ) -> Self {
        Self {
            local,
            remote,
            strategy: StrategyCell::new(strategy),
            privileges,
            already_privileged: process_is_privileged(),
        }
    }

    pub fn strategy(&self) -> RootStrategy {
        self.strategy.get()
    }

    fn can_escalate(&self) -> bool {
        // A privileged process gains nothing from the broker detour.
        !self.already_privileged && self.privileges.can_escalate()
    }
}

impl Backend for RootableBackend {
    fn scheme(&self) -> &str {
        self.local.scheme()
    }

    fn instance(&self) -> &str {
        self.local.instance()
    }

    fn is_closed(&self) -> bool {
        self.local.is_closed()
    }

    fn close(&self) {
        self.local.close();
        self.remote.close();
    }

    fn read_attributes(&self, path: &VfsPath, follow_links: bool) -> Result<FileAttributes, FsError> {
        route_single(
            &self.strategy,
            self.can_escalate(),
            || self.local.read_attributes(path, follow_links),
            || self.remote.read_attributes(path, follow_links),
        )
    }

    fn list_children(&self, path: &VfsPath) -> Result<Vec<(Vec<u8>, FileAttributes)>, FsError> {
        route_single(
            &self.strategy,
            self.can_escalate(),
            || self.local.list_children(path),
            || self.remote.list_children(path),
        )
    }

    fn create_file(&self, path: &VfsPath) -> Result<(), FsError> {
        route_single(
            &self.strategy,
            self.can_escalate(),
            || self.local.create_file(path),
            || self.remote.create_file(path),
        )
    }

    fn create_directory(&self, path: &VfsPath) -> Result<(), FsError> {
        route_single(
            &self.strategy,
            self.can_escalate(),
            || self.local.create_directory(path),
            || self.remote.create_directory(path),
        )
    }

    fn delete(&self, path: &VfsPath) -> Result<(), FsError> {
        route_single(
            &self.strategy,
            self.can_escalate(),
            || self.local.delete(path),
            || self.remote.delete(path),
        )
    }

    fn rename(&self, from: &VfsPath, to: &VfsPath, replace: bool) -> Result<(), FsError> {
        route_pair(
            &self.strategy,
            &self.strategy,
            self.can_escalate(),
            || self.local.rename(from, to, replace),
            || self.remote.rename(from, to, replace),
        )
    }

    fn copy(&self, from: &VfsPath, to: &VfsPath, options: &CopyOptions<'_>) -> Result<(), FsError> {
        route_pair(
            &self.strategy,
            &self.strategy,
            self.can_escalate(),
            || self.local.copy(from, to, options),
            || self.remote.copy(from, to, options),
        )
    }

    fn move_to(&self, from: &VfsPath, to: &VfsPath, options: &CopyOptions<'_>) -> Result<(), FsError> {
        route_pair(
            &self.strategy,
            &self.strategy,
            self.can_escalate(),
            || self.local.move_to(from, to, options),
            || self.remote.move_to(from, to, options),
        )
    }

    fn read_symbolic_link(&self, path: &VfsPath) -> Result<Vec<u8>, FsError> {
        route_single(
            &self.strategy,
            self.can_escalate(),
            || self.local.read_symbolic_link(path),
            || self.remote.read_symbolic_link(path),
        )
    }

    fn create_symbolic_link(&self, path: &VfsPath, target: &[u8]) -> Result<(), FsError> {
        route_single(
            &self.strategy,
            self.can_escalate(),
            || self.local.create_symbolic_link(path, target),
            || self.remote.create_symbolic_link(path, target),
        )
    }

    fn open_read(&self, path: &VfsPath) -> Result<ReadStream, FsError> {
        // Streams are not proxied over the broker; only the local side can
        // hand out a file handle.
        self.local.open_read(path)
    }

    fn write_from_stream(
        &self,
        path: &VfsPath,
        size: u64,
        stream: ReadStream,
        replace: bool,
    ) -> Result<u64, FsError> {
        self.local.write_from_stream(path, size, stream, replace)
    }

    fn observe(
        &self,
        path: &VfsPath,
        interval: Duration,
        listener: ChangeListener,
    ) -> Result<Box<dyn WatchHandle>, FsError> {
        self.local.observe(path, interval, listener)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn denied() -> FsError {
        FsError::AccessDenied {
            path: "/p".to_string(),
            message: "test".to_string(),
        }
    }

    #[test]
    fn never_only_calls_local() {
        let cell = StrategyCell::new(RootStrategy::Never);
        let privileged_calls = AtomicUsize::new(0);
        let result = route_single(
            &cell,
            true,
            || Err::<u32, _>(denied()),
            || {
                privileged_calls.fetch_add(1, Ordering::Relaxed);
                Ok(1)
            },
        );
        assert!(result.unwrap_err().is_access_denied());
        assert_eq!(privileged_calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn always_only_calls_privileged() {
        let cell = StrategyCell::new(RootStrategy::Always);
        let local_calls = AtomicUsize::new(0);
        let result = route_single(
            &cell,
            true,
            || {
                local_calls.fetch_add(1, Ordering::Relaxed);
                Ok(1u32)
            },
            || Ok(2),
        );
        assert_eq!(result.unwrap(), 2);
        assert_eq!(local_calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn prefer_no_converges_after_privileged_success() {
        let cell = StrategyCell::new(RootStrategy::PreferNo);
        let local_calls = AtomicUsize::new(0);

        let result = route_single(
            &cell,
            true,
            || {
                local_calls.fetch_add(1, Ordering::Relaxed);
                Err::<u32, _>(denied())
            },
            || Ok(7),
        );
        assert_eq!(result.unwrap(), 7);
        assert_eq!(cell.get(), RootStrategy::PreferYes);

        // Subsequent operations on the same path skip the local attempt.
        let result = route_single(
            &cell,
            true,
            || {
                local_calls.fetch_add(1, Ordering::Relaxed);
                Ok(0u32)
            },
            || Ok(8),
        );
        assert_eq!(result.unwrap(), 8);
        assert_eq!(local_calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn prefer_no_does_not_converge_on_privileged_failure() {
        let cell = StrategyCell::new(RootStrategy::PreferNo);
        let result = route_single(
            &cell,
            true,
            || Err::<u32, _>(denied()),
            || {
                Err(FsError::Channel {
                    message: "broker dead".to_string(),
                })
            },
        );
        assert!(result.unwrap_err().is_channel_error());
        assert_eq!(cell.get(), RootStrategy::PreferNo);
    }

    #[test]
    fn prefer_no_surfaces_non_denied_errors_without_retry() {
        let cell = StrategyCell::new(RootStrategy::PreferNo);
        let privileged_calls = AtomicUsize::new(0);
        let result = route_single(
            &cell,
            true,
            || Err::<u32, _>(FsError::NotFound { path: "/p".to_string() }),
            || {
                privileged_calls.fetch_add(1, Ordering::Relaxed);
                Ok(1)
            },
        );
        assert!(matches!(result.unwrap_err(), FsError::NotFound { .. }));
        assert_eq!(privileged_calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn prefer_yes_falls_back_to_local_on_channel_failure_only() {
        let cell = StrategyCell::new(RootStrategy::PreferYes);
        let result = route_single(
            &cell,
            true,
            || Ok(1u32),
            || {
                Err(FsError::Channel {
                    message: "timed out".to_string(),
                })
            },
        );
        assert_eq!(result.unwrap(), 1);
        // No state mutation on fallback.
        assert_eq!(cell.get(), RootStrategy::PreferYes);

        // A real remote error is surfaced, not retried locally.
        let result = route_single(&cell, true, || Ok(1u32), || Err::<u32, _>(denied()));
        assert!(result.unwrap_err().is_access_denied());
    }

    #[test]
    fn unavailable_escalation_behaves_like_never() {
        let cell = StrategyCell::new(RootStrategy::Always);
        let result = route_single(&cell, false, || Ok(1u32), || Ok(2));
        assert_eq!(result.unwrap(), 1);
    }

    #[test]
    fn strategy_combination_is_asymmetric() {
        use RootStrategy::*;
        assert_eq!(combine_strategies(Never, Always), Never);
        assert_eq!(combine_strategies(Always, PreferNo), Always);
        assert_eq!(combine_strategies(PreferYes, PreferNo), PreferYes);
        assert_eq!(combine_strategies(PreferNo, PreferNo), PreferNo);
    }

    #[test]
    fn pair_routing_does_not_mutate_cells() {
        let a = StrategyCell::new(RootStrategy::PreferNo);
        let b = StrategyCell::new(RootStrategy::PreferNo);
        let result = route_pair(&a, &b, true, || Err::<u32, _>(denied()), || Ok(3));
        assert_eq!(result.unwrap(), 3);
        assert_eq!(a.get(), RootStrategy::PreferNo);
        assert_eq!(b.get(), RootStrategy::PreferNo);
    }

    #[test]
    fn cell_transitions_are_monotonic() {
        let never = StrategyCell::new(RootStrategy::Never);
        never.prefer_root_now();
        assert_eq!(never.get(), RootStrategy::Never);

        let prefer_no = StrategyCell::new(RootStrategy::PreferNo);
        prefer_no.prefer_root_now();
        prefer_no.prefer_root_now();
        assert_eq!(prefer_no.get(), RootStrategy::PreferYes);
    }
}
