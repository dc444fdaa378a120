use std::ops::Range;
use std::sync::OnceLock;

/// Work, in multiply-accumulates, that makes one extra task worth scheduling.
const THREAD_COMPLEXITY: usize = 64 * 1024;
const MAX_TASKS: usize = 16;
/// Hybrid (big/little core) parts get finer tasks so slow cores do not straggle.
const MAX_TASKS_HYBRID: usize = 64;

/// Number of output-position tiles to split one image into.
///
/// Scales with `output_image_size * group_output_channels * kernel_dim`, is
/// capped at 16 (64 on hybrid CPUs), at the number of output positions, and at
/// the pool's parallelism when a pool is used.
pub fn max_thread_count(
    output_image_size: usize,
    group_output_channels: usize,
    kernel_dim: usize,
    hybrid: bool,
    pool_threads: Option<usize>,
) -> usize {
    let max_tasks = if hybrid { MAX_TASKS_HYBRID } else { MAX_TASKS };
    let complexity = output_image_size
        .saturating_mul(group_output_channels)
        .saturating_mul(kernel_dim);

    let mut count = max_tasks;
    if complexity < THREAD_COMPLEXITY * max_tasks {
        count = complexity / THREAD_COMPLEXITY + 1;
    }
    count = count.min(output_image_size);
    if let Some(threads) = pool_threads {
        count = count.min(threads);
    }
    count.max(1)
}

/// Contiguous slice `index` of `total` items split `count` ways; the first
/// `total % count` slices get one extra item.
pub fn partition_work(index: usize, count: usize, total: usize) -> Range<usize> {
    let per_task = total / count;
    let remainder = total % count;
    if index < remainder {
        let start = (per_task + 1) * index;
        start..start + per_task + 1
    } else {
        let start = per_task * index + remainder;
        start..start + per_task
    }
}

/// Whether the CPU mixes performance and efficiency cores.
pub fn is_hybrid_cpu() -> bool {
    static HYBRID: OnceLock<bool> = OnceLock::new();
    *HYBRID.get_or_init(detect_hybrid)
}

#[cfg(target_arch = "x86_64")]
fn detect_hybrid() -> bool {
    use std::arch::x86_64::__cpuid_count;
    // CPUID.(EAX=7,ECX=0):EDX[15] is the Hybrid flag.
    let max_leaf = unsafe { __cpuid_count(0, 0) }.eax;
    if max_leaf < 7 {
        return false;
    }
    let leaf7 = unsafe { __cpuid_count(7, 0) };
    leaf7.edx & (1 << 15) != 0
}

#[cfg(not(target_arch = "x86_64"))]
fn detect_hybrid() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_covers_range() {
        for (count, total) in [(1, 10), (3, 10), (4, 4), (5, 3), (16, 100)] {
            let mut next = 0;
            for i in 0..count {
                let r = partition_work(i, count, total);
                assert_eq!(r.start, next);
                assert!(r.len() == total / count || r.len() == total / count + 1);
                next = r.end;
            }
            assert_eq!(next, total);
        }
        assert_eq!(partition_work(0, 3, 10), 0..4);
        assert_eq!(partition_work(2, 3, 10), 7..10);
    }

    #[test]
    fn test_max_thread_count() {
        // Small problem: one task.
        assert_eq!(max_thread_count(16, 4, 9, false, None), 1);
        // 64*1024*3 MACs -> 4 tasks.
        assert_eq!(max_thread_count(1024, 64, 3, false, None), 4);
        // Large problem hits the cap.
        assert_eq!(max_thread_count(1 << 16, 256, 256, false, None), 16);
        assert_eq!(max_thread_count(1 << 16, 256, 256, true, None), 64);
        // Never more tiles than positions or pool threads.
        assert_eq!(max_thread_count(3, 1 << 20, 1 << 10, false, None), 3);
        assert_eq!(max_thread_count(1 << 16, 256, 256, false, Some(2)), 2);
        assert_eq!(max_thread_count(0, 4, 4, false, None), 1);
    }
}
