//! Small containers the standard collections don't cover.

pub mod ring_buffer;

pub use ring_buffer::RingBuffer;

use alloc::collections::VecDeque;

/// Insert `value` into a deque that is sorted ascending by `key`, keeping it
/// sorted. Ties land after existing equal elements, so insertion order is
/// preserved among equals.
pub fn sorted_insert_by_key<T, K, F>(deque: &mut VecDeque<T>, value: T, mut key: F)
where
    K: Ord,
    F: FnMut(&T) -> K,
{
    let k = key(&value);
    let pos = deque.partition_point(|existing| key(existing) <= k);
    deque.insert(pos, value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorted_insert_keeps_order() {
        let mut d: VecDeque<(u32, char)> = VecDeque::new();
        for v in [(5, 'a'), (1, 'b'), (9, 'c'), (5, 'd'), (5, 'e')] {
            sorted_insert_by_key(&mut d, v, |t| t.0);
        }
        let keys: alloc::vec::Vec<u32> = d.iter().map(|t| t.0).collect();
        assert_eq!(keys, [1, 5, 5, 5, 9]);
        // ties keep insertion order
        let fives: alloc::vec::Vec<char> =
            d.iter().filter(|t| t.0 == 5).map(|t| t.1).collect();
        assert_eq!(fives, ['a', 'd', 'e']);
    }
}
