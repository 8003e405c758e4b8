/// Byte-shuffle `src` by `typesize`: byte `j` of every element is gathered
/// into the `j`-th plane. Trailing bytes that do not form a whole element are
/// copied unchanged.
pub fn shuffle(src: &[u8], typesize: usize) -> Vec<u8> {
    if typesize <= 1 || src.len() < typesize {
        return src.to_vec();
    }
    let nelems = src.len() / typesize;
    let body = nelems * typesize;
    let mut dst = vec![0u8; src.len()];
    for (i, elem) in src[..body].chunks_exact(typesize).enumerate() {
        for (j, byte) in elem.iter().enumerate() {
            dst[j * nelems + i] = *byte;
        }
    }
    dst[body..].copy_from_slice(&src[body..]);
    dst
}

/// Inverse of [`shuffle`].
pub fn unshuffle(src: &[u8], typesize: usize) -> Vec<u8> {
    if typesize <= 1 || src.len() < typesize {
        return src.to_vec();
    }
    let nelems = src.len() / typesize;
    let body = nelems * typesize;
    let mut dst = vec![0u8; src.len()];
    for (i, elem) in dst[..body].chunks_exact_mut(typesize).enumerate() {
        for (j, byte) in elem.iter_mut().enumerate() {
            *byte = src[j * nelems + i];
        }
    }
    dst[body..].copy_from_slice(&src[body..]);
    dst
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gathers_byte_planes() {
        let src = [1u8, 2, 3, 4, 5, 6, 7, 8, 9];
        assert_eq!(shuffle(&src, 4), vec![1, 5, 2, 6, 3, 7, 4, 8, 9]);
        assert_eq!(unshuffle(&shuffle(&src, 4), 4), src);
    }

    #[test]
    fn degenerate_inputs_pass_through() {
        assert_eq!(shuffle(b"abc", 1), b"abc");
        assert_eq!(shuffle(b"abc", 8), b"abc");
        assert!(shuffle(&[], 4).is_empty());
    }
}
