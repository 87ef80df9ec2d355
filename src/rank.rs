//! Process-role gating for multi-process training.
//!
//! In data-parallel runs every process holds an identical replica, so only
//! the primary process writes metrics. The role is injected rather than read
//! from global state so the analyzer can be tested without a distributed
//! runtime.

/// Query whether the current process should write shared metrics.
pub trait ProcessRole {
    /// `true` on the designated primary process.
    fn is_primary(&self) -> bool;
}

impl<R: ProcessRole + ?Sized> ProcessRole for &R {
    fn is_primary(&self) -> bool {
        (**self).is_primary()
    }
}

impl<R: ProcessRole + ?Sized> ProcessRole for Box<R> {
    fn is_primary(&self) -> bool {
        (**self).is_primary()
    }
}

/// No distributed runtime: always primary.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl ProcessRole for SingleProcess {
    fn is_primary(&self) -> bool {
        true
    }
}

/// A fixed global rank. Rank 0 is primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticRank {
    /// Global rank of this process.
    pub rank: usize,
    /// Number of processes in the run.
    pub world_size: usize,
}

impl StaticRank {
    /// Create a role for `rank` out of `world_size` processes.
    #[must_use]
    pub const fn new(rank: usize, world_size: usize) -> Self {
        Self { rank, world_size }
    }
}

impl ProcessRole for StaticRank {
    fn is_primary(&self) -> bool {
        self.rank == 0
    }
}

/// Rank taken from the launcher environment (`RANK`, `WORLD_SIZE`).
///
/// When `RANK` is unset or unparsable the process is treated as a single,
/// primary process. The environment is read once, at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvRank {
    rank: Option<usize>,
    world_size: Option<usize>,
}

impl EnvRank {
    /// Environment variable holding the global rank.
    pub const RANK_VAR: &'static str = "RANK";
    /// Environment variable holding the number of processes.
    pub const WORLD_SIZE_VAR: &'static str = "WORLD_SIZE";

    /// Read the rank from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the rank through an arbitrary lookup function.
    #[must_use]
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |key: &str| lookup(key).and_then(|v| v.trim().parse::<usize>().ok());
        let rank = parse(Self::RANK_VAR);
        let world_size = parse(Self::WORLD_SIZE_VAR);
        if rank.is_none() {
            tracing::debug!("no distributed rank in environment, assuming primary process");
        }
        Self { rank, world_size }
    }

    /// Global rank, if a distributed launcher set one.
    #[must_use]
    pub const fn rank(&self) -> Option<usize> {
        self.rank
    }

    /// World size, if a distributed launcher set one.
    #[must_use]
    pub const fn world_size(&self) -> Option<usize> {
        self.world_size
    }

    /// Whether a distributed launcher is present.
    #[must_use]
    pub const fn is_distributed(&self) -> bool {
        self.rank.is_some()
    }
}

impl ProcessRole for EnvRank {
    fn is_primary(&self) -> bool {
        self.rank.map_or(true, |r| r == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_single_process_is_primary() {
        assert!(SingleProcess.is_primary());
    }

    #[test]
    fn test_static_rank() {
        assert!(StaticRank::new(0, 4).is_primary());
        assert!(!StaticRank::new(3, 4).is_primary());
    }

    #[test]
    fn test_env_rank_absent_is_primary() {
        let role = EnvRank::from_lookup(lookup_from(&[]));
        assert!(role.is_primary());
        assert!(!role.is_distributed());
    }

    #[test]
    fn test_env_rank_parsing() {
        let role = EnvRank::from_lookup(lookup_from(&[("RANK", "2"), ("WORLD_SIZE", "8")]));
        assert!(!role.is_primary());
        assert_eq!(role.rank(), Some(2));
        assert_eq!(role.world_size(), Some(8));

        let role = EnvRank::from_lookup(lookup_from(&[("RANK", " 0 ")]));
        assert!(role.is_primary());

        let role = EnvRank::from_lookup(lookup_from(&[("RANK", "not-a-number")]));
        assert!(role.is_primary());
    }

    #[test]
    fn test_boxed_role() {
        let role: Box<dyn ProcessRole> = Box::new(StaticRank::new(1, 2));
        assert!(!role.is_primary());
    }
}
