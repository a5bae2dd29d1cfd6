//! 一致性哈希环
//!
//! 每个地址在环上放置 `replicas` 个虚拟节点，虚拟节点的位置为
//! `crc32("<i><address>")`。查找时取第一个哈希值不小于 `crc32(key)` 的
//! 虚拟节点，超过最大值时回绕到环首。

/// 默认虚拟节点数
pub const DEFAULT_REPLICAS: usize = 20;

#[derive(Debug, Clone, Default)]
pub struct HashRing {
    replicas: usize,
    /// (虚拟节点哈希, 地址下标)，按哈希升序
    points: Vec<(u32, usize)>,
    addresses: Vec<String>,
}

impl HashRing {
    pub fn new(replicas: usize) -> Self {
        Self {
            replicas: replicas.max(1),
            points: Vec::new(),
            addresses: Vec::new(),
        }
    }

    /// 由地址集合构建环，结果与输入顺序无关
    pub fn with_addresses<I, S>(replicas: usize, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ring = Self::new(replicas);
        let mut addresses: Vec<String> = addresses.into_iter().map(Into::into).collect();
        addresses.sort();
        addresses.dedup();
        for address in addresses {
            ring.push_address(address);
        }
        ring.rebuild_points();
        ring
    }

    pub fn hash_key(key: &str) -> u32 {
        crc32fast::hash(key.as_bytes())
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    /// 加入一个地址；已存在时不变
    pub fn add(&mut self, address: impl Into<String>) {
        let address = address.into();
        if self.addresses.contains(&address) {
            return;
        }
        self.push_address(address);
        self.rebuild_points();
    }

    /// 移除一个地址及其全部虚拟节点
    pub fn remove(&mut self, address: &str) -> bool {
        let Some(pos) = self.addresses.iter().position(|a| a == address) else {
            return false;
        };
        self.addresses.remove(pos);
        self.rebuild_points();
        true
    }

    /// 查找负责 `key` 的地址
    pub fn get(&self, key: &str) -> Option<&str> {
        self.owner_of_hash(Self::hash_key(key))
    }

    pub fn owner_of_hash(&self, hash: u32) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }
        // 闭区间下界：哈希值等于虚拟节点时归属该节点
        let idx = self.points.partition_point(|(point, _)| *point < hash);
        let (_, owner) = if idx == self.points.len() {
            self.points[0]
        } else {
            self.points[idx]
        };
        Some(self.addresses[owner].as_str())
    }

    fn push_address(&mut self, address: String) {
        self.addresses.push(address);
    }

    fn rebuild_points(&mut self) {
        // 地址按字典序编号，哈希冲突时由较小的地址持有该位置
        self.addresses.sort();
        let mut points = Vec::with_capacity(self.addresses.len() * self.replicas);
        for (idx, address) in self.addresses.iter().enumerate() {
            for replica in 0..self.replicas {
                points.push((Self::hash_key(&format!("{replica}{address}")), idx));
            }
        }
        points.sort_unstable();
        points.dedup_by_key(|(hash, _)| *hash);
        self.points = points;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owners(ring: &HashRing, keys: &[String]) -> Vec<String> {
        keys.iter()
            .map(|k| ring.get(k).unwrap_or_default().to_string())
            .collect()
    }

    #[test]
    fn test_empty_ring_returns_none() {
        let ring = HashRing::new(DEFAULT_REPLICAS);
        assert!(ring.is_empty());
        assert!(ring.get("any-key").is_none());
    }

    #[test]
    fn test_single_address_owns_all_keys() {
        let ring = HashRing::with_addresses(DEFAULT_REPLICAS, ["10.0.0.1:9000"]);
        for i in 0..100 {
            assert_eq!(ring.get(&format!("key-{i}")), Some("10.0.0.1:9000"));
        }
    }

    #[test]
    fn test_exact_hash_maps_to_that_virtual_node() {
        let ring = HashRing::with_addresses(3, ["a:1", "b:2"]);
        let hash = HashRing::hash_key("1b:2");
        assert_eq!(ring.owner_of_hash(hash), Some("b:2"));
        let hash = HashRing::hash_key("0a:1");
        assert_eq!(ring.owner_of_hash(hash), Some("a:1"));
    }

    #[test]
    fn test_wraps_around_past_largest_point() {
        let ring = HashRing::with_addresses(DEFAULT_REPLICAS, ["a:1", "b:2", "c:3"]);
        let smallest = ring.points[0];
        let expected = ring.addresses[smallest.1].clone();
        assert_eq!(ring.owner_of_hash(u32::MAX), Some(expected.as_str()));
        if ring.points.last().map(|p| p.0) != Some(u32::MAX) {
            let last = ring.points.last().map(|p| p.0).unwrap_or_default();
            assert_eq!(ring.owner_of_hash(last + 1), Some(expected.as_str()));
        }
    }

    #[test]
    fn test_build_order_does_not_matter() {
        let a = HashRing::with_addresses(DEFAULT_REPLICAS, ["a:1", "b:2", "c:3"]);
        let b = HashRing::with_addresses(DEFAULT_REPLICAS, ["c:3", "a:1", "b:2"]);
        let mut c = HashRing::new(DEFAULT_REPLICAS);
        c.add("b:2");
        c.add("c:3");
        c.add("a:1");

        let keys: Vec<String> = (0..500).map(|i| format!("user-{i}")).collect();
        assert_eq!(owners(&a, &keys), owners(&b, &keys));
        assert_eq!(owners(&a, &keys), owners(&c, &keys));
    }

    #[test]
    fn test_remove_only_moves_keys_of_removed_address() {
        let mut ring = HashRing::with_addresses(DEFAULT_REPLICAS, ["a:1", "b:2", "c:3", "d:4"]);
        let keys: Vec<String> = (0..2000).map(|i| format!("key-{i}")).collect();
        let before = owners(&ring, &keys);

        assert!(ring.remove("b:2"));
        assert!(!ring.remove("b:2"));
        let after = owners(&ring, &keys);

        for (old, new) in before.iter().zip(after.iter()) {
            if old != "b:2" {
                assert_eq!(old, new);
            } else {
                assert_ne!(new, "b:2");
            }
        }
    }

    #[test]
    fn test_add_only_moves_keys_to_new_address() {
        let mut ring = HashRing::with_addresses(DEFAULT_REPLICAS, ["a:1", "b:2", "c:3"]);
        let keys: Vec<String> = (0..2000).map(|i| format!("key-{i}")).collect();
        let before = owners(&ring, &keys);

        ring.add("d:4");
        let after = owners(&ring, &keys);

        for (old, new) in before.iter().zip(after.iter()) {
            if old != new {
                assert_eq!(new, "d:4");
            }
        }
    }
}
