//! A minimal in-process stand-in for the KV store's sorted-set primitive
//! (`ZADD`/`ZPOPMIN`/`ZRANGEBYSCORE`/`ZRANGE`/`ZCARD`/`ZREM`). Not meant to be
//! fast — [`InMemoryKv`](crate::InMemoryKv) favors obviously-correct
//! reference behavior over the performance a real backend needs.

#[derive(Debug, Default, Clone)]
pub struct SortedSet {
    // kept sorted ascending by (score, id) after every mutation.
    entries: Vec<(f64, u64)>,
}

impl SortedSet {
    fn resort(&mut self) {
        self.entries
            .sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    }

    pub fn insert(&mut self, score: f64, id: u64) {
        self.remove(id);
        self.entries.push((score, id));
        self.resort();
    }

    pub fn remove(&mut self, id: u64) -> Option<f64> {
        let pos = self.entries.iter().position(|&(_, i)| i == id)?;
        Some(self.entries.remove(pos).0)
    }

    pub fn score(&self, id: u64) -> Option<f64> {
        self.entries.iter().find(|&&(_, i)| i == id).map(|&(s, _)| s)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.iter().any(|&(_, i)| i == id)
    }

    /// Removes and returns the lowest-scored member, if any (`ZPOPMIN`).
    pub fn pop_min(&mut self) -> Option<(f64, u64)> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0))
        }
    }

    /// All members with `score <= max_score`, in ascending order (`ZRANGEBYSCORE -inf max`).
    pub fn due(&self, max_score: f64) -> Vec<u64> {
        self.entries
            .iter()
            .take_while(|&&(s, _)| s <= max_score)
            .map(|&(_, id)| id)
            .collect()
    }

    /// Up to `limit` members with `score <= max_score`, oldest first, used by `Clean`.
    pub fn due_limited(&self, max_score: f64, limit: usize) -> Vec<u64> {
        self.due(max_score).into_iter().take(limit).collect()
    }

    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Members in ascending index range `[from, to)` (`ZRANGE from to`).
    pub fn page(&self, from: u64, to: u64) -> Vec<u64> {
        let from = from as usize;
        let to = (to as usize).min(self.entries.len());
        if from >= to {
            return Vec::new();
        }
        self.entries[from..to].iter().map(|&(_, id)| id).collect()
    }

    /// Oldest `count` members, used when trimming retention sets
    /// (`ZRANGE 0 count-1` in the Lua scripts' equivalent).
    pub fn oldest(&self, count: u64) -> Vec<u64> {
        self.entries
            .iter()
            .take(count as usize)
            .map(|&(_, id)| id)
            .collect()
    }

    pub fn iter_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.iter().map(|&(_, id)| id)
    }
}
