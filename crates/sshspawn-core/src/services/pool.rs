use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use rand::seq::SliceRandom;

use crate::error::{Result, SpawnerError};
use crate::models::{HostRecord, LoadBalancerKind, ServerStatus, SpawnedServerRecord};

/// Picks one host out of a non-empty candidate list.
///
/// Any `Fn(&[Arc<HostRecord>]) -> Option<Arc<HostRecord>>` closure works, so a
/// deployment can weight by capacity or consult its own health checks without
/// touching the pool.
pub trait LoadBalancer: Send + Sync {
    fn select(&self, hosts: &[Arc<HostRecord>]) -> Option<Arc<HostRecord>>;
}

impl<F> LoadBalancer for F
where
    F: Fn(&[Arc<HostRecord>]) -> Option<Arc<HostRecord>> + Send + Sync,
{
    fn select(&self, hosts: &[Arc<HostRecord>]) -> Option<Arc<HostRecord>> {
        self(hosts)
    }
}

/// Fewest running servers wins; ties are broken uniformly at random.
#[derive(Debug, Default, Clone, Copy)]
pub struct LeastLoaded;

impl LoadBalancer for LeastLoaded {
    fn select(&self, hosts: &[Arc<HostRecord>]) -> Option<Arc<HostRecord>> {
        let counts: Vec<usize> = hosts.iter().map(|h| h.session_count()).collect();
        let min = *counts.iter().min()?;
        let candidates: Vec<&Arc<HostRecord>> = hosts
            .iter()
            .zip(&counts)
            .filter(|(_, &count)| count == min)
            .map(|(host, _)| host)
            .collect();
        candidates.choose(&mut rand::thread_rng()).map(|h| Arc::clone(h))
    }
}

/// Cycles through the candidates in order, ignoring load.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl LoadBalancer for RoundRobin {
    fn select(&self, hosts: &[Arc<HostRecord>]) -> Option<Arc<HostRecord>> {
        if hosts.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % hosts.len();
        Some(Arc::clone(&hosts[index]))
    }
}

/// The configured hosts and the policy used to choose between them.
///
/// Session counters live on the shared [`HostRecord`]s, so concurrent
/// launches and stops only contend on the record they touch.
pub struct HostPool {
    hosts: RwLock<Vec<Arc<HostRecord>>>,
    balancer: Box<dyn LoadBalancer>,
}

impl HostPool {
    pub fn new<I, S>(hostnames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            hosts: RwLock::new(build_records(hostnames)),
            balancer: Box::new(LeastLoaded),
        }
    }

    pub fn with_kind<I, S>(hostnames: I, kind: LoadBalancerKind) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pool = Self::new(hostnames);
        match kind {
            LoadBalancerKind::LeastLoaded => pool,
            LoadBalancerKind::RoundRobin => pool.with_balancer(RoundRobin::default()),
        }
    }

    pub fn with_balancer(mut self, balancer: impl LoadBalancer + 'static) -> Self {
        self.balancer = Box::new(balancer);
        self
    }

    /// Snapshot of the current records.
    pub fn hosts(&self) -> Vec<Arc<HostRecord>> {
        self.hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn host(&self, hostname: &str) -> Option<Arc<HostRecord>> {
        self.hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|h| h.hostname() == hostname)
            .cloned()
    }

    pub fn select(&self) -> Result<Arc<HostRecord>> {
        self.select_excluding(&[])
    }

    /// Select among the hosts not named in `excluded`, typically ones that
    /// just failed as unreachable.
    pub fn select_excluding(&self, excluded: &[String]) -> Result<Arc<HostRecord>> {
        let candidates: Vec<Arc<HostRecord>> = self
            .hosts()
            .into_iter()
            .filter(|h| !excluded.iter().any(|e| e == h.hostname()))
            .collect();
        if candidates.is_empty() {
            return Err(SpawnerError::NoHostsAvailable);
        }
        let chosen = self
            .balancer
            .select(&candidates)
            .ok_or(SpawnerError::NoHostsAvailable)?;
        if !candidates.iter().any(|h| Arc::ptr_eq(h, &chosen)) {
            tracing::warn!(host = chosen.hostname(), "load balancer chose a host outside the candidates");
            return Err(SpawnerError::NoHostsAvailable);
        }
        tracing::debug!(
            host = chosen.hostname(),
            sessions = chosen.session_count(),
            candidates = candidates.len(),
            "selected host"
        );
        Ok(chosen)
    }

    /// Replace the host list, keeping counters for hosts that remain.
    pub fn reload<I, S>(&self, hostnames: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut hosts = self.hosts.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = Vec::new();
        for name in hostnames {
            let name = name.into();
            if next.iter().any(|h: &Arc<HostRecord>| h.hostname() == name) {
                continue;
            }
            let record = hosts
                .iter()
                .find(|h| h.hostname() == name)
                .cloned()
                .unwrap_or_else(|| Arc::new(HostRecord::new(name)));
            next.push(record);
        }
        *hosts = next;
    }

    /// Re-seed counters from records the orchestrator persisted before a
    /// restart. Stopped records and unknown hosts are ignored.
    pub fn restore<'a>(&self, records: impl IntoIterator<Item = &'a SpawnedServerRecord>) {
        for record in records {
            if record.status == ServerStatus::Stopped {
                continue;
            }
            match self.host(&record.hostname) {
                Some(host) => {
                    host.increment();
                }
                None => tracing::warn!(
                    host = %record.hostname,
                    pid = record.pid,
                    "restored record refers to a host outside the pool"
                ),
            }
        }
    }
}

fn build_records<I, S>(hostnames: I) -> Vec<Arc<HostRecord>>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut records: Vec<Arc<HostRecord>> = Vec::new();
    for name in hostnames {
        let name = name.into();
        if !records.iter().any(|h| h.hostname() == name) {
            records.push(Arc::new(HostRecord::new(name)));
        }
    }
    records
}
