//! Sandbox-wide resource sizing from per-container assignments.

use crate::container::Container;
use crate::error::{CoreError, Result};
use crate::state::ContainerState;

/// Milli-CPUs a quota/period pair amounts to.
#[must_use]
pub fn milli_cpus(quota: i64, period: u64) -> u32 {
    if quota <= 0 || period == 0 {
        return 0;
    }
    let period = i64::try_from(period).unwrap_or(i64::MAX);
    u32::try_from(quota.saturating_mul(1000) / period).unwrap_or(u32::MAX)
}

/// Whole vCPUs needed to satisfy a milli-CPU amount, rounded up.
#[must_use]
pub const fn vcpus_from_milli_cpus(milli: u32) -> u32 {
    milli.div_ceil(1000)
}

/// Number of CPUs named by a cpuset list such as `"0-2,4"`.
///
/// # Errors
///
/// Returns `InvalidConfig` on a malformed list; a bad cpuset must never be
/// silently read as zero CPUs.
pub fn cpuset_count(cpuset: &str) -> Result<u32> {
    let cpuset = cpuset.trim();
    if cpuset.is_empty() {
        return Ok(0);
    }
    let bad = |msg: &str| CoreError::InvalidConfig(format!("cpuset {cpuset:?}: {msg}"));
    let mut count: u32 = 0;
    for part in cpuset.split(',') {
        let part = part.trim();
        if let Some((lo, hi)) = part.split_once('-') {
            let lo: u32 = lo.trim().parse().map_err(|_| bad("bad range start"))?;
            let hi: u32 = hi.trim().parse().map_err(|_| bad("bad range end"))?;
            if hi < lo {
                return Err(bad("range end before start"));
            }
            count += hi - lo + 1;
        } else {
            let _: u32 = part.parse().map_err(|_| bad("bad CPU number"))?;
            count += 1;
        }
    }
    Ok(count)
}

/// vCPUs the containers of a sandbox need, before the boot-time default is
/// added on top. Quota/period wins per container; a cpuset only counts when
/// no quota is set. Stopped containers are skipped, their share returns to
/// the pool.
pub fn sandbox_cpus(containers: &[&Container]) -> Result<u32> {
    let mut milli: u32 = 0;
    for container in containers {
        if container.state() == ContainerState::Stopped {
            continue;
        }
        let res = &container.config().resources;
        let from_quota = milli_cpus(res.cpu_quota, res.cpu_period);
        if from_quota > 0 {
            milli = milli.saturating_add(from_quota);
        } else {
            milli = milli.saturating_add(cpuset_count(&res.cpuset_cpus)? * 1000);
        }
    }
    Ok(vcpus_from_milli_cpus(milli))
}

/// Memory the containers of a sandbox need. Stopped containers are skipped.
///
/// Returns the byte sum of all memory limits, whether pod swap must cover
/// the whole VM (a swappy container carries no memory limit), and the swap
/// bytes the limited containers add up to. Swap is only sized when the guest
/// has swap enabled; a container with swappiness but no explicit swap limit
/// swaps up to its memory limit.
#[must_use]
pub fn sandbox_memory(containers: &[&Container], guest_swap: bool) -> (u64, bool, i64) {
    let mut memory: u64 = 0;
    let mut need_pod_swap = false;
    let mut swap_bytes: i64 = 0;
    for container in containers {
        if container.state() == ContainerState::Stopped {
            continue;
        }
        let res = &container.config().resources;
        let limit = res.memory_limit_bytes;
        if limit > 0 {
            memory = memory.saturating_add(limit.unsigned_abs());
        }
        if guest_swap && res.memory_swappiness > 0 {
            if res.memory_swap_bytes == 0 {
                if limit == 0 {
                    need_pod_swap = true;
                } else {
                    swap_bytes = swap_bytes.saturating_add(limit);
                }
            } else if res.memory_swap_bytes > limit {
                swap_bytes = swap_bytes.saturating_add(res.memory_swap_bytes - limit);
            }
        }
    }
    (memory, need_pod_swap, swap_bytes)
}

/// MiB needed to hold `bytes`, rounded up.
#[must_use]
pub const fn bytes_to_mib_ceil(bytes: u64) -> u32 {
    let mib = bytes.div_ceil(1 << 20);
    if mib > u32::MAX as u64 {
        u32::MAX
    } else {
        mib as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContainerConfig, ContainerResources};

    fn with_resources(resources: ContainerResources) -> Container {
        Container::new(ContainerConfig {
            resources,
            ..ContainerConfig::default()
        })
    }

    fn with_cpu(quota: i64, period: u64) -> Container {
        with_resources(ContainerResources {
            cpu_quota: quota,
            cpu_period: period,
            ..ContainerResources::default()
        })
    }

    fn with_memory(limit: i64, swap: i64, swappiness: i64) -> Container {
        with_resources(ContainerResources {
            memory_limit_bytes: limit,
            memory_swap_bytes: swap,
            memory_swappiness: swappiness,
            ..ContainerResources::default()
        })
    }

    #[test]
    fn two_half_cpu_containers_need_one_vcpu() {
        // 50ms quota over a 100ms period, twice
        let a = with_cpu(50_000, 100_000);
        let b = with_cpu(50_000, 100_000);
        assert_eq!(sandbox_cpus(&[&a, &b]).unwrap(), 1);
    }

    #[test]
    fn quota_rounds_up_not_down() {
        let c = with_cpu(150_000, 100_000);
        assert_eq!(sandbox_cpus(&[&c]).unwrap(), 2);
    }

    #[test]
    fn cpuset_is_a_fallback_only() {
        let mut c = with_cpu(0, 0);
        c.config.resources.cpuset_cpus = "0-2,4".into();
        assert_eq!(sandbox_cpus(&[&c]).unwrap(), 4);

        // with a quota present the cpuset is ignored
        c.config.resources.cpu_quota = 100_000;
        c.config.resources.cpu_period = 100_000;
        assert_eq!(sandbox_cpus(&[&c]).unwrap(), 1);
    }

    #[test]
    fn malformed_cpusets_are_errors() {
        assert!(cpuset_count("0-2,x").is_err());
        assert!(cpuset_count("5-2").is_err());
        assert_eq!(cpuset_count("").unwrap(), 0);
        assert_eq!(cpuset_count(" 1 , 3-4 ").unwrap(), 3);

        let mut c = with_cpu(0, 0);
        c.config.resources.cpuset_cpus = "not-a-set".into();
        assert!(sandbox_cpus(&[&c]).is_err());
    }

    #[test]
    fn stopped_containers_do_not_count() {
        let a = with_cpu(100_000, 100_000);
        let mut b = with_cpu(100_000, 100_000);
        b.state = ContainerState::Stopped;
        assert_eq!(sandbox_cpus(&[&a, &b]).unwrap(), 1);

        let c = with_memory(256 << 20, 0, 0);
        let mut d = with_memory(256 << 20, 0, 0);
        d.state = ContainerState::Stopped;
        let (mem, _, _) = sandbox_memory(&[&c, &d], false);
        assert_eq!(mem, 256 << 20);
    }

    #[test]
    fn memory_sums_limits_and_sizes_swap() {
        let a = with_memory(256 << 20, 0, 0);
        let b = with_memory(256 << 20, 512 << 20, 60);

        let (mem, need_pod_swap, swap) = sandbox_memory(&[&a, &b], true);
        assert_eq!(mem, 512 << 20);
        assert!(!need_pod_swap);
        assert_eq!(swap, 256 << 20);

        // swappiness zero means no swap request
        let c = with_memory(256 << 20, 512 << 20, 0);
        let (_, need_pod_swap, swap) = sandbox_memory(&[&a, &c], true);
        assert!(!need_pod_swap);
        assert_eq!(swap, 0);
    }

    #[test]
    fn swap_needs_the_guest_to_have_it_enabled() {
        let c = with_memory(256 << 20, 512 << 20, 60);
        let (mem, need_pod_swap, swap) = sandbox_memory(&[&c], false);
        assert_eq!(mem, 256 << 20);
        assert!(!need_pod_swap);
        assert_eq!(swap, 0);
    }

    #[test]
    fn swappy_container_without_a_limit_swaps_the_whole_vm() {
        let c = with_memory(0, 0, 60);
        let (mem, need_pod_swap, swap) = sandbox_memory(&[&c], true);
        assert_eq!(mem, 0);
        assert!(need_pod_swap);
        assert_eq!(swap, 0);
    }

    #[test]
    fn swappy_container_without_a_swap_limit_swaps_its_memory_limit() {
        let c = with_memory(256 << 20, 0, 60);
        let (_, need_pod_swap, swap) = sandbox_memory(&[&c], true);
        assert!(!need_pod_swap);
        assert_eq!(swap, 256 << 20);
    }

    #[test]
    fn mib_rounding_is_ceiling() {
        assert_eq!(bytes_to_mib_ceil(0), 0);
        assert_eq!(bytes_to_mib_ceil(1), 1);
        assert_eq!(bytes_to_mib_ceil(1 << 20), 1);
        assert_eq!(bytes_to_mib_ceil((1 << 20) + 1), 2);
    }
}
