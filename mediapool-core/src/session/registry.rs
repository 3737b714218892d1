use crate::SessionConfig;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use x25519_dalek::PublicKey;

/// Server side record binding a client chosen session id to a public key.
#[derive(Debug, Clone)]
pub struct SessionContainer {
    pub session_id: String,
    pub client_public_key: PublicKey,
    pub last_modification: DateTime<Utc>,
}

impl SessionContainer {
    fn touch(&mut self) {
        let now = Utc::now();
        self.last_modification = if now > self.last_modification {
            now
        } else {
            self.last_modification + Duration::microseconds(1)
        };
    }
}

/// Capacity bounded registry of active client sessions.
///
/// Every operation runs under one lock and never performs I/O while
/// holding it.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, SessionContainer>>,
    max_active_sessions: usize,
    percentage_rate_for_cleaning: u32,
}

impl SessionRegistry {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_active_sessions: config.max_active_sessions,
            percentage_rate_for_cleaning: config.percentage_rate_for_cleaning.min(100),
        }
    }

    /// True when the session exists; refreshes its modification date.
    pub async fn check(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(session_id) {
            Some(session) => {
                session.touch();
                true
            }
            None => false,
        }
    }

    /// Snapshot of the session; refreshes its modification date.
    pub async fn get(&self, session_id: &str) -> Option<SessionContainer> {
        let mut sessions = self.sessions.lock().await;
        sessions.get_mut(session_id).map(|session| {
            session.touch();
            session.clone()
        })
    }

    /// Registers a new session. Returns false if the id is already taken.
    pub async fn add(&self, session_id: &str, client_public_key: PublicKey) -> bool {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(session_id) {
            return false;
        }

        if sessions.len() >= self.max_active_sessions {
            let removed = evict_oldest(&mut sessions, self.percentage_rate_for_cleaning);
            tracing::info!(
                "Session registry at capacity ({}), evicted {} sessions",
                self.max_active_sessions,
                removed
            );
        }

        sessions.insert(
            session_id.to_string(),
            SessionContainer {
                session_id: session_id.to_string(),
                client_public_key,
                last_modification: Utc::now(),
            },
        );
        true
    }

    /// Removes the configured percentage of sessions, oldest first.
    /// Returns the number of removed sessions.
    pub async fn evict_percentage(&self) -> usize {
        let mut sessions = self.sessions.lock().await;
        evict_oldest(&mut sessions, self.percentage_rate_for_cleaning)
    }

    pub async fn remove(&self, session_id: &str) -> bool {
        self.sessions.lock().await.remove(session_id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }
}

fn evict_oldest(sessions: &mut HashMap<String, SessionContainer>, percentage: u32) -> usize {
    let count = sessions.len() * percentage as usize / 100;
    let snapshot: Vec<(String, DateTime<Utc>)> = sessions
        .values()
        .map(|session| (session.session_id.clone(), session.last_modification))
        .collect();

    let victims = select_oldest(snapshot, count);
    for session_id in &victims {
        sessions.remove(session_id);
    }
    victims.len()
}

/// Picks the `count` entries with the oldest modification date. Entries with
/// equal dates keep their snapshot order.
pub fn select_oldest(mut snapshot: Vec<(String, DateTime<Utc>)>, count: usize) -> Vec<String> {
    snapshot.sort_by_key(|(_, modified)| *modified);
    snapshot
        .into_iter()
        .take(count)
        .map(|(session_id, _)| session_id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use x25519_dalek::StaticSecret;

    fn key() -> PublicKey {
        PublicKey::from(&StaticSecret::random_from_rng(rand::rngs::OsRng))
    }

    fn registry(max: usize, percentage: u32) -> SessionRegistry {
        SessionRegistry::new(&SessionConfig {
            max_active_sessions: max,
            percentage_rate_for_cleaning: percentage,
        })
    }

    #[tokio::test]
    async fn test_add_check_get() {
        let registry = registry(10, 20);
        assert!(registry.add("S1", key()).await);
        assert!(!registry.add("S1", key()).await);

        assert!(registry.check("S1").await);
        assert!(!registry.check("S2").await);
        assert!(registry.get("S1").await.is_some());
        assert!(registry.get("S2").await.is_none());
    }

    #[tokio::test]
    async fn test_touch_strictly_increases() {
        let registry = registry(10, 20);
        registry.add("S1", key()).await;

        let mut last = registry.get("S1").await.unwrap().last_modification;
        for _ in 0..50 {
            assert!(registry.check("S1").await);
            let after_check = registry.get("S1").await.unwrap().last_modification;
            assert!(after_check > last);
            last = after_check;
        }
    }

    #[tokio::test]
    async fn test_evict_percentage_removes_oldest() {
        let registry = registry(100, 30);
        for i in 0..10 {
            registry.add(&format!("S{}", i), key()).await;
        }
        // Refresh the upper half so the lower ids are the oldest.
        for i in 5..10 {
            registry.check(&format!("S{}", i)).await;
        }
        registry.check("S4").await;

        assert_eq!(registry.evict_percentage().await, 3);
        assert_eq!(registry.len().await, 7);

        let survivors: Vec<bool> = {
            let mut flags = Vec::new();
            for i in 0..10 {
                flags.push(registry.check(&format!("S{}", i)).await);
            }
            flags
        };
        assert_eq!(survivors.iter().filter(|alive| !**alive).count(), 3);
        assert!(survivors[4..].iter().all(|alive| *alive));
    }

    #[tokio::test]
    async fn test_add_at_capacity_evicts_first() {
        let registry = registry(4, 50);
        for i in 0..4 {
            registry.add(&format!("S{}", i), key()).await;
        }
        registry.check("S0").await;
        registry.check("S1").await;

        assert!(registry.add("S4", key()).await);
        assert_eq!(registry.len().await, 3);
        assert!(registry.check("S0").await);
        assert!(registry.check("S1").await);
        assert!(!registry.check("S2").await);
        assert!(!registry.check("S3").await);
    }

    #[test]
    fn test_select_oldest_is_floor_and_stable() {
        let base = Utc::now();
        let snapshot = vec![
            ("c".to_string(), base + Duration::seconds(2)),
            ("a".to_string(), base),
            ("b".to_string(), base),
            ("d".to_string(), base + Duration::seconds(3)),
        ];

        assert_eq!(select_oldest(snapshot.clone(), 4 * 60 / 100), vec!["a", "b"]);
        assert_eq!(select_oldest(snapshot.clone(), 3), vec!["a", "b", "c"]);
        assert!(select_oldest(snapshot, 0).is_empty());
    }
}
