/// Number of overlapping vertical strips needed to cover an image.
///
/// `chunks = max(1, ceil((height - overlap) / (chunk_size - overlap)))`.
/// `overlap` must be smaller than `chunk_size`; a degenerate step is
/// treated as a single strip.
pub fn chunk_count(height: u32, chunk_size: u32, overlap: u32) -> u32 {
    if overlap >= chunk_size || height <= overlap {
        return 1;
    }
    let covered = u64::from(height - overlap);
    let step = u64::from(chunk_size - overlap);
    covered.div_ceil(step).max(1) as u32
}

/// Ordered strip indices `[0, 1, ..., chunks - 1]` for an image of `height`
pub fn plan_chunks(height: u32, chunk_size: u32, overlap: u32) -> Vec<u32> {
    (0..chunk_count(height, chunk_size, overlap)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_chunk_when_image_fits() {
        assert_eq!(chunk_count(250, 250, 90), 1);
        assert_eq!(plan_chunks(250, 250, 90), vec![0]);
    }

    #[test]
    fn test_tall_image() {
        // ceil(910 / 160) = 6
        assert_eq!(chunk_count(1000, 250, 90), 6);
        assert_eq!(plan_chunks(1000, 250, 90), vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_exact_multiple() {
        // (410 - 90) / 160 = 2 exactly
        assert_eq!(chunk_count(410, 250, 90), 2);
        assert_eq!(chunk_count(411, 250, 90), 3);
    }

    #[test]
    fn test_short_images_get_one_chunk() {
        assert_eq!(chunk_count(0, 250, 90), 1);
        assert_eq!(chunk_count(50, 250, 90), 1);
        assert_eq!(chunk_count(90, 250, 90), 1);
    }

    #[test]
    fn test_degenerate_overlap() {
        assert_eq!(chunk_count(1000, 100, 100), 1);
    }
}
