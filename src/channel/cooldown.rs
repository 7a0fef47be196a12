//! # 渠道冷却表
//!
//! (渠道, 模型) 粒度的瞬态屏蔽：分片哈希表，条目按 TTL 过期。
//! 读路径只锁单分片，写路径同样不触碰全局锁。

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::types::ChannelId;

const SHARD_COUNT: usize = 16;

/// 分片 TTL 冷却表
pub struct CooldownMap {
    shards: Vec<Mutex<HashMap<(ChannelId, String), Instant>>>,
}

impl Default for CooldownMap {
    fn default() -> Self {
        Self::new()
    }
}

impl CooldownMap {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
        }
    }

    fn shard(&self, channel_id: ChannelId) -> &Mutex<HashMap<(ChannelId, String), Instant>> {
        let index = usize::try_from(channel_id.unsigned_abs()).unwrap_or(0) % SHARD_COUNT;
        &self.shards[index]
    }

    /// 写入或延长冷却
    pub fn set(&self, channel_id: ChannelId, model: &str, duration: Duration) {
        let until = Instant::now() + duration;
        let mut shard = self.shard(channel_id).lock().unwrap();
        shard.insert((channel_id, model.to_string()), until);
    }

    /// 冷却是否生效；过期条目就地回收
    pub fn is_active(&self, channel_id: ChannelId, model: &str) -> bool {
        let key = (channel_id, model.to_string());
        let mut shard = self.shard(channel_id).lock().unwrap();
        match shard.get(&key) {
            Some(until) if *until > Instant::now() => true,
            Some(_) => {
                shard.remove(&key);
                false
            }
            None => false,
        }
    }

    /// 周期清扫：删除全部过期条目，返回删除数
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap();
            let before = shard.len();
            shard.retain(|_, until| *until > now);
            removed += before - shard.len();
        }
        removed
    }

    /// 活跃条目数（测试与诊断用）
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().unwrap().len())
            .sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_blocks_until_expiry() {
        let map = CooldownMap::new();
        map.set(1, "gpt-4o", Duration::from_secs(60));
        assert!(map.is_active(1, "gpt-4o"));
        // 其他模型与渠道不受影响
        assert!(!map.is_active(1, "gpt-4o-mini"));
        assert!(!map.is_active(2, "gpt-4o"));
    }

    #[test]
    fn expired_entries_are_reclaimed_on_read() {
        let map = CooldownMap::new();
        map.set(7, "gpt-4o", Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(!map.is_active(7, "gpt-4o"));
        assert!(map.is_empty());
    }

    #[test]
    fn sweep_removes_expired_only() {
        let map = CooldownMap::new();
        map.set(1, "a", Duration::from_millis(0));
        map.set(2, "b", Duration::from_secs(300));
        std::thread::sleep(Duration::from_millis(5));
        let removed = map.sweep();
        assert_eq!(removed, 1);
        assert_eq!(map.len(), 1);
        assert!(map.is_active(2, "b"));
    }
}
