//! NUMA (Non-Uniform Memory Access) topology detection
//!
//! On multi-socket hosts the inference engine keeps its KV cache within one
//! node's local memory, so the node count feeds directly into cache sizing.
//! Container sandboxes frequently block the NUMA policy syscalls; that is
//! detected separately because thread binding must be disabled when it happens.

use std::path::Path;

/// Root of the kernel's NUMA node listing
const NODE_ROOT: &str = "/sys/devices/system/node";

/// NUMA node information
#[derive(Debug, Clone)]
pub struct NumaNode {
    /// Node ID
    pub id: usize,
    /// CPUs belonging to this node
    pub cpus: Vec<usize>,
    /// Total memory in bytes
    pub memory_total: u64,
}

/// NUMA topology information
#[derive(Debug, Clone)]
pub struct NumaTopology {
    /// NUMA nodes, sorted by ID
    pub nodes: Vec<NumaNode>,
    /// Whether NUMA policy syscalls are permitted in this process
    pub accessible: bool,
}

impl NumaTopology {
    /// Detect NUMA topology from the system
    pub fn detect() -> Self {
        let nodes = Self::read_nodes(Path::new(NODE_ROOT));
        let accessible = numa_syscalls_permitted();

        tracing::debug!(
            "NUMA: {} node(s) listed, policy syscalls {}",
            nodes.len(),
            if accessible { "permitted" } else { "blocked" }
        );

        Self { nodes, accessible }
    }

    /// Number of nodes, at least 1
    pub fn node_count(&self) -> usize {
        self.nodes.len().max(1)
    }

    /// Is this a multi-node system?
    pub fn is_numa_system(&self) -> bool {
        self.nodes.len() > 1
    }

    /// Read node directories (`node0`, `node1`, ...) below `root`
    fn read_nodes(root: &Path) -> Vec<NumaNode> {
        let mut nodes = Vec::new();

        let entries = match std::fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!("NUMA listing unavailable at {}: {}", root.display(), e);
                return nodes;
            }
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name();
            let name_str = name.to_string_lossy();

            let Some(id) = name_str
                .strip_prefix("node")
                .and_then(|n| n.parse::<usize>().ok())
            else {
                continue;
            };

            let node_path = entry.path();
            let cpus = std::fs::read_to_string(node_path.join("cpulist"))
                .map(|content| parse_cpu_list(content.trim()))
                .unwrap_or_default();
            let memory_total = std::fs::read_to_string(node_path.join("meminfo"))
                .ok()
                .and_then(|content| parse_node_mem_total(&content))
                .unwrap_or(0);

            nodes.push(NumaNode {
                id,
                cpus,
                memory_total,
            });
        }

        nodes.sort_by_key(|n| n.id);
        nodes
    }

    /// Print NUMA topology summary
    pub fn print_summary(&self) {
        println!("NUMA Topology:");
        println!(
            "  Nodes: {}{}",
            self.node_count(),
            if self.is_numa_system() { " (multi-node)" } else { "" }
        );
        println!("  Policy syscalls: {}", if self.accessible { "permitted" } else { "blocked" });

        for node in &self.nodes {
            print!("  Node {}: {} CPUs", node.id, node.cpus.len());
            if node.memory_total > 0 {
                print!(", {}", humansize::format_size(node.memory_total, humansize::BINARY));
            }
            println!();
        }
    }
}

/// Parse CPU list format (e.g., "0-3,8-11" -> [0,1,2,3,8,9,10,11])
pub fn parse_cpu_list(s: &str) -> Vec<usize> {
    let mut cpus = Vec::new();

    for part in s.split(',') {
        let part = part.trim();
        if let Some((start, end)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start.parse::<usize>(), end.parse::<usize>()) {
                cpus.extend(start..=end);
            }
        } else if let Ok(cpu) = part.parse::<usize>() {
            cpus.push(cpu);
        }
    }

    cpus
}

/// Extract MemTotal in bytes from a per-node meminfo file
/// (format: "Node 0 MemTotal:       12345 kB")
fn parse_node_mem_total(content: &str) -> Option<u64> {
    content
        .lines()
        .find(|line| line.contains("MemTotal:"))
        .and_then(|line| line.split_whitespace().nth(3))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

/// Probe whether `get_mempolicy` is allowed.
///
/// Docker's default seccomp profile rejects the NUMA policy family with
/// `EPERM` unless the container has `CAP_SYS_NICE`; kernels built without
/// NUMA return `ENOSYS`. Either way NUMA-aware binding cannot work.
#[cfg(target_os = "linux")]
fn numa_syscalls_permitted() -> bool {
    let mut mode: libc::c_int = 0;

    // SAFETY: get_mempolicy with a null nodemask and maxnode 0 only writes the
    // policy mode into `mode`, which outlives the call.
    let result = unsafe {
        libc::syscall(
            libc::SYS_get_mempolicy,
            &mut mode as *mut libc::c_int,
            std::ptr::null_mut::<libc::c_ulong>(),
            0 as libc::c_ulong,
            std::ptr::null_mut::<libc::c_void>(),
            0 as libc::c_ulong,
        )
    };

    if result == 0 {
        return true;
    }

    let err = std::io::Error::last_os_error();
    tracing::debug!("get_mempolicy probe failed: {}", err);
    !matches!(err.raw_os_error(), Some(libc::EPERM) | Some(libc::ENOSYS))
}

#[cfg(not(target_os = "linux"))]
fn numa_syscalls_permitted() -> bool {
    false
}
