use crate::{Error, Result};

/// `declared` if given, otherwise one past the largest index (0 for an empty index).
pub fn maybe_num_nodes(index: &[u32], declared: Option<usize>) -> usize {
    declared.unwrap_or_else(|| index.iter().max().map_or(0, |&i| i as usize + 1))
}

/// Right-aligned broadcast of two leading-dimension lists.
pub(crate) fn broadcast_dims(op: &'static str, lhs: &[usize], rhs: &[usize]) -> Result<Vec<usize>> {
    let rank = lhs.len().max(rhs.len());
    let mut dims = vec![1; rank];
    for (i, dim) in dims.iter_mut().enumerate() {
        let l = if i + lhs.len() >= rank { lhs[i + lhs.len() - rank] } else { 1 };
        let r = if i + rhs.len() >= rank { rhs[i + rhs.len() - rank] } else { 1 };
        *dim = match (l, r) {
            (l, r) if l == r => l,
            (1, r) => r,
            (l, 1) => l,
            _ => return Err(Error::shape(op, format!("{lhs:?}"), format!("{rhs:?}"))),
        };
    }
    Ok(dims)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_node_count() {
        assert_eq!(maybe_num_nodes(&[0, 4, 2], None), 5);
        assert_eq!(maybe_num_nodes(&[0, 4, 2], Some(9)), 9);
        assert_eq!(maybe_num_nodes(&[], None), 0);
    }

    #[test]
    fn broadcasts_leading_dims() {
        assert_eq!(broadcast_dims("t", &[2, 1], &[3]).unwrap(), vec![2, 3]);
        assert_eq!(broadcast_dims("t", &[], &[4, 5]).unwrap(), vec![4, 5]);
        assert!(broadcast_dims("t", &[2], &[3]).is_err());
    }
}
