use crate::pool::Pool;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancing {
    #[default]
    RoundRobin,
    LeastConnections,
}

/// Orders replica pools for one checkout. Holds no per-client state.
#[derive(Debug, Default)]
pub struct Balancer {
    strategy: LoadBalancing,
    next: AtomicUsize,
}

impl Balancer {
    pub fn new(strategy: LoadBalancing) -> Self {
        Self {
            strategy,
            next: AtomicUsize::new(0),
        }
    }

    /// Candidates in the order they should be tried; offline pools are skipped.
    pub fn candidates<'a>(&self, pools: &'a [Pool]) -> Vec<&'a Pool> {
        let online: Vec<&Pool> = pools.iter().filter(|pool| pool.is_online()).collect();
        if online.is_empty() {
            return online;
        }
        match self.strategy {
            LoadBalancing::RoundRobin => {
                let start = self.next.fetch_add(1, Ordering::Relaxed) % online.len();
                online[start..]
                    .iter()
                    .chain(online[..start].iter())
                    .copied()
                    .collect()
            }
            LoadBalancing::LeastConnections => {
                let mut ranked: Vec<(usize, &Pool)> =
                    online.into_iter().map(|pool| (pool.load(), pool)).collect();
                ranked.sort_by_key(|(load, _)| *load);
                ranked.into_iter().map(|(_, pool)| pool).collect()
            }
        }
    }
}
