use fnv::FnvHashMap as HashMap;
use std::hash::Hash;

/// partition membership vector into groups of indexes
/// # Arguments
/// * `membership` - a vector of membership (E.g., donor or cluster)
/// # Returns
/// A hashmap: group name -> ascending indexes of the elements
pub fn partition_by_membership<T>(membership: &[T]) -> HashMap<T, Vec<usize>>
where
    T: Eq + Hash + Clone,
{
    let mut pb_elems: HashMap<T, Vec<usize>> = HashMap::default();
    for (cell, k) in membership.iter().enumerate() {
        pb_elems.entry(k.clone()).or_default().push(cell);
    }
    pb_elems
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_by_membership() {
        let membership = vec!["a", "b", "a", "c", "a"];
        let groups = partition_by_membership(&membership);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups["a"], vec![0, 2, 4]);
        assert_eq!(groups["c"], vec![3]);
        assert_eq!(groups.values().map(|v| v.len()).sum::<usize>(), membership.len());
    }
}
