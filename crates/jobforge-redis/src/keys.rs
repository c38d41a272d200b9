//! Key-name construction for the schema documented in `lib.rs`'s module docs
//! and SPEC_FULL §4.1. Centralized here so every script/command builds the
//! exact same strings.

pub struct Keys<'a> {
    queue: &'a str,
}

impl<'a> Keys<'a> {
    pub fn new(queue: &'a str) -> Self {
        Keys { queue }
    }

    pub fn id_counter(&self) -> String {
        format!("jq:{}:id", self.queue)
    }

    pub fn job(&self, id: u64) -> String {
        format!("jq:{}:job:{}", self.queue, id)
    }

    /// Key prefix a script concatenates with an id to address `jq:{q}:job:{id}`
    /// for ids it discovers itself (e.g. scanning a sorted set).
    pub fn job_prefix(&self) -> String {
        format!("jq:{}:job:", self.queue)
    }

    pub fn wait(&self) -> String {
        format!("jq:{}:wait", self.queue)
    }

    pub fn delayed(&self) -> String {
        format!("jq:{}:delayed", self.queue)
    }

    pub fn active(&self) -> String {
        format!("jq:{}:active", self.queue)
    }

    pub fn completed(&self) -> String {
        format!("jq:{}:completed", self.queue)
    }

    pub fn failed(&self) -> String {
        format!("jq:{}:failed", self.queue)
    }

    pub fn paused(&self) -> String {
        format!("jq:{}:paused", self.queue)
    }

    pub fn rl_tokens(&self) -> String {
        format!("jq:{}:rl:tokens", self.queue)
    }

    pub fn rl_reset(&self) -> String {
        format!("jq:{}:rl:reset", self.queue)
    }

    pub fn rate_limit_config(&self) -> String {
        format!("jq:{}:rl:config", self.queue)
    }

    pub fn keep(&self) -> String {
        format!("jq:{}:keep", self.queue)
    }

    pub fn repeat(&self, repeat_id: &str) -> String {
        format!("jq:{}:repeat:{}", self.queue, repeat_id)
    }

    pub fn repeat_index(&self) -> String {
        format!("jq:{}:repeat:index", self.queue)
    }

    pub fn dedup(&self, key: &str) -> String {
        format!("jq:{}:dedup:{}", self.queue, key)
    }

    pub fn events_channel() -> &'static str {
        "jq:events"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_prefix_is_a_strict_prefix_of_job() {
        let k = Keys::new("emails");
        assert_eq!(format!("{}123", k.job_prefix()), k.job(123));
    }

    #[test]
    fn keys_are_namespaced_per_queue() {
        let a = Keys::new("emails");
        let b = Keys::new("reports");
        assert_ne!(a.wait(), b.wait());
        assert_ne!(a.active(), b.active());
        assert_ne!(a.dedup("x"), b.dedup("x"));
    }

    #[test]
    fn events_channel_is_global_not_per_queue() {
        assert_eq!(Keys::events_channel(), Keys::events_channel());
        assert_eq!(Keys::events_channel(), "jq:events");
    }
}
