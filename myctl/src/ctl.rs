use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use myops_common::probes::Probes;
use myops_types::{Mysql, process_rand_id};
use tokio::sync::{Mutex, Notify};

use crate::group::MysqlGroup;

/// Cluster key: `(namespace, name)`.
pub type GroupKey = (String, String);

/// The coordinator process context: the only strong handle to every
/// supervised cluster, plus the event channel the reconciliation shell
/// drains.
#[derive(Clone)]
pub struct Myctl {
    inner: Arc<MyctlInner>,
}

struct MyctlInner {
    groups: Mutex<HashMap<GroupKey, MysqlGroup>>,
    events: EventQueue,
    probes: Probes,
    client: reqwest::Client,
    rand_id: i64,
    #[cfg(feature = "metrics")]
    metrics: crate::metrics::CtlMetrics,
}

impl Myctl {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MyctlInner {
                groups: Mutex::new(HashMap::new()),
                events: EventQueue::new(64),
                probes: Probes::new(),
                client: reqwest::Client::new(),
                rand_id: process_rand_id(),
                #[cfg(feature = "metrics")]
                metrics: crate::metrics::CtlMetrics::new(),
            }),
        }
    }

    pub fn probes(&self) -> &Probes {
        &self.inner.probes
    }

    pub fn events(&self) -> &EventQueue {
        &self.inner.events
    }

    pub fn rand_id(&self) -> i64 {
        self.inner.rand_id
    }

    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> &crate::metrics::CtlMetrics {
        &self.inner.metrics
    }

    pub async fn group(&self, key: &GroupKey) -> Option<MysqlGroup> {
        self.inner.groups.lock().await.get(key).cloned()
    }

    /// Look up or lazily create the group for this cluster, spawning its
    /// background loop on first sight.
    pub async fn get_or_new_group(&self, mysql: &Mysql) -> Result<MysqlGroup> {
        let key = mysql.nn();
        let mut groups = self.inner.groups.lock().await;
        if let Some(g) = groups.get(&key) {
            return Ok(g.clone());
        }

        let group = MysqlGroup::create(
            mysql.clone(),
            self.inner.events.clone(),
            self.inner.client.clone(),
            self.inner.rand_id,
        )?;
        groups.insert(key, group.clone());
        tokio::spawn(group.clone().run());
        Ok(group)
    }

    /// Absorb a spec change, then reflect the authoritative spec and status
    /// back into the caller's object.
    pub async fn sync_spec(&self, mysql: &mut Mysql) -> Result<()> {
        let group = self.get_or_new_group(mysql).await?;
        let mut state = group.state().lock().await;
        state.diff(mysql)?;
        mysql.spec = state.mysql.spec.clone();
        mysql.status = state.mysql.status.clone();
        Ok(())
    }

    /// Reflect the authoritative spec and status into the caller's object.
    pub async fn sync_status(&self, mysql: &mut Mysql) -> Result<()> {
        let group = self.get_or_new_group(mysql).await?;
        let state = group.state().lock().await;
        mysql.spec = state.mysql.spec.clone();
        mysql.status = state.mysql.status.clone();
        Ok(())
    }

    /// Drop a deleted cluster and stop its loop.
    pub async fn purge(&self, key: &GroupKey) {
        let mut groups = self.inner.groups.lock().await;
        if let Some(group) = groups.remove(key) {
            group.stop();
            tracing::info!(namespace = %key.0, name = %key.1, "purged group");
        }
    }

    /// Stop every group loop; used on shutdown.
    pub async fn stop_all(&self) {
        let groups = self.inner.groups.lock().await;
        for group in groups.values() {
            group.stop();
        }
    }
}

impl Default for Myctl {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded single-consumer queue feeding the reconciliation shell. Overflow
/// drops the oldest entry: the consumer only re-triggers reconciles, so a
/// missed event is covered by any later one.
#[derive(Clone)]
pub struct EventQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    cap: usize,
    items: std::sync::Mutex<VecDeque<GroupKey>>,
    notify: Notify,
}

impl EventQueue {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                cap: cap.max(1),
                items: std::sync::Mutex::new(VecDeque::new()),
                notify: Notify::new(),
            }),
        }
    }

    pub fn push(&self, key: GroupKey) {
        {
            let mut items = self.inner.items.lock().expect("event queue poisoned");
            if items.len() >= self.inner.cap {
                items.pop_front();
            }
            items.push_back(key);
        }
        self.inner.notify.notify_one();
    }

    pub async fn pop(&self) -> GroupKey {
        loop {
            if let Some(key) = self
                .inner
                .items
                .lock()
                .expect("event queue poisoned")
                .pop_front()
            {
                return key;
            }
            self.inner.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.items.lock().expect("event queue poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u32) -> GroupKey {
        ("default".to_string(), format!("demo-{n}"))
    }

    #[tokio::test]
    async fn event_queue_drops_oldest_on_overflow() {
        let q = EventQueue::new(2);
        q.push(key(1));
        q.push(key(2));
        q.push(key(3));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop().await, key(2));
        assert_eq!(q.pop().await, key(3));
    }

    #[tokio::test]
    async fn event_queue_wakes_waiting_consumer() {
        let q = EventQueue::new(4);
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move { q.pop().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        q.push(key(7));
        assert_eq!(consumer.await.expect("join"), key(7));
    }
}
