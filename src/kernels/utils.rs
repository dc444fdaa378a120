/// Element count of a shape; the empty shape has one element.
pub fn shape_size(shape: &[usize]) -> usize {
    shape.iter().product()
}

pub fn ensure_len<T: Copy + Default>(v: &mut Vec<T>, len: usize) {
    if v.len() != len {
        v.clear();
        v.resize(len, T::default());
    }
}

/// Writes the multi-index of `offset` within `shape` into `indices`.
pub fn offset_to_indices(mut offset: usize, shape: &[usize], indices: &mut [usize]) {
    for i in (0..shape.len()).rev() {
        indices[i] = offset % shape[i];
        offset /= shape[i];
    }
}

/// Advances a row-major multi-index by one. Returns false after wrapping past the end.
pub fn next_index(indices: &mut [usize], shape: &[usize]) -> bool {
    for i in (0..shape.len()).rev() {
        indices[i] += 1;
        if indices[i] < shape[i] {
            return true;
        }
        indices[i] = 0;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn test_offset_to_indices() {
        let mut idx = [0; 3];
        offset_to_indices(17, &[2, 3, 4], &mut idx);
        assert_eq!(idx, [1, 1, 1]);
        assert_eq!(shape_size(&[]), 1);
    }
    #[test]
    fn test_next_index_wraps() {
        let shape = [2, 2];
        let mut idx = [0, 0];
        let mut seen = vec![idx.to_vec()];
        while next_index(&mut idx, &shape) {
            seen.push(idx.to_vec());
        }
        assert_eq!(seen, vec![vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1]]);
        assert_eq!(idx, [0, 0]);
    }
}
