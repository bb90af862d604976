//! On-demand CPU profiling: record with the external profiler, fold the
//! stacks, and emit a hierarchical `{name, value, children}` tree.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::ProfilerError;

const SAMPLE_HZ: &str = "99";
const PROBE_SECONDS: &str = "1";

/// One frame in the flame tree; `value` equals the sum of its leaves' counts.
/// Child ordering is insertion order and carries no meaning.
#[derive(Debug, Serialize)]
pub struct FlameNode {
    pub name: String,
    pub value: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FlameNode>,
}

impl FlameNode {
    fn root() -> Self {
        Self {
            name: "root".to_string(),
            value: 0,
            children: Vec::new(),
        }
    }
}

/// Runs the external profiler pipeline. The profiler and stack-folder are
/// injected command names so deployments can substitute wrappers.
pub struct FlamegraphGenerator {
    dev_mode: bool,
    profiler_cmd: String,
    collapse_cmd: String,
}

impl FlamegraphGenerator {
    pub fn new(dev_mode: bool) -> Self {
        Self {
            dev_mode,
            profiler_cmd: "perf".to_string(),
            collapse_cmd: "stackcollapse-perf.pl".to_string(),
        }
    }

    pub fn with_commands(
        dev_mode: bool,
        profiler_cmd: impl Into<String>,
        collapse_cmd: impl Into<String>,
    ) -> Self {
        Self {
            dev_mode,
            profiler_cmd: profiler_cmd.into(),
            collapse_cmd: collapse_cmd.into(),
        }
    }

    /// Records `duration_seconds` of CPU samples for `pid` and returns the
    /// serialized flame tree. In dev mode a deterministic placeholder comes
    /// back instead so the control plane is testable without a kernel
    /// profiler.
    pub async fn generate(
        &self,
        node_name: &str,
        pod_name: &str,
        duration_seconds: i32,
        pid: i32,
    ) -> Result<Vec<u8>, ProfilerError> {
        if self.dev_mode {
            return Ok(format!(
                "Mock flamegraph data for node:{node_name} pod:{pod_name} duration:{duration_seconds}s"
            )
            .into_bytes());
        }

        if pid <= 0 || !pid_visible(pid) {
            return Err(ProfilerError::InvalidPid(pid));
        }

        self.probe(pid).await?;

        let tmp = tempdir()?;
        let perf_data = tmp.join("perf.data");
        self.record(pid, duration_seconds, &perf_data).await?;

        let folded = self.fold(&perf_data).await?;
        let tree = build_tree(&folded);
        let bytes = serde_json::to_vec(&tree)?;

        // Best-effort cleanup; the recording already succeeded.
        let _ = std::fs::remove_dir_all(&tmp);
        Ok(bytes)
    }

    /// A one-second attach proves the kernel will let us sample this PID.
    async fn probe(&self, pid: i32) -> Result<(), ProfilerError> {
        let output = Command::new(&self.profiler_cmd)
            .args(["stat", "-p", &pid.to_string(), "sleep", PROBE_SECONDS])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| self.spawn_error(&self.profiler_cmd, e))?;

        if !output.status.success() {
            return Err(ProfilerError::CannotProfile(pid));
        }
        Ok(())
    }

    async fn record(
        &self,
        pid: i32,
        duration_seconds: i32,
        output_file: &Path,
    ) -> Result<(), ProfilerError> {
        let duration = duration_seconds.max(1) as u64;
        let ceiling = duration * 3 + 60;

        let mut child = Command::new(&self.profiler_cmd)
            .args([
                "record",
                "-F",
                SAMPLE_HZ,
                "-p",
                &pid.to_string(),
                "-g",
                "-o",
            ])
            .arg(output_file)
            .args(["sleep", &duration.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_error(&self.profiler_cmd, e))?;

        // Let the profiler finish naturally; only the hard ceiling kills it.
        match tokio::time::timeout(Duration::from_secs(ceiling), child.wait()).await {
            Ok(status) => {
                if !status?.success() {
                    return Err(ProfilerError::EmptyOutput("profiler record"));
                }
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(ProfilerError::Timeout(ceiling));
            }
        }

        let recorded = std::fs::metadata(output_file).map(|m| m.len()).unwrap_or(0);
        if recorded == 0 {
            return Err(ProfilerError::EmptyOutput("profiler record"));
        }
        Ok(())
    }

    /// `perf script` then the stack-folder, yielding `frame;frame;… count`
    /// lines.
    async fn fold(&self, perf_data: &Path) -> Result<String, ProfilerError> {
        let script = Command::new(&self.profiler_cmd)
            .args(["script", "-i"])
            .arg(perf_data)
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| self.spawn_error(&self.profiler_cmd, e))?;
        if !script.status.success() || script.stdout.is_empty() {
            return Err(ProfilerError::EmptyOutput("profiler script"));
        }

        let mut collapse = Command::new(&self.collapse_cmd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.spawn_error(&self.collapse_cmd, e))?;

        if let Some(mut stdin) = collapse.stdin.take() {
            stdin.write_all(&script.stdout).await?;
        }
        let folded = collapse.wait_with_output().await?;
        if !folded.status.success() || folded.stdout.is_empty() {
            return Err(ProfilerError::EmptyOutput("stack folder"));
        }

        Ok(String::from_utf8_lossy(&folded.stdout).into_owned())
    }

    fn spawn_error(&self, tool: &str, e: std::io::Error) -> ProfilerError {
        if e.kind() == std::io::ErrorKind::NotFound {
            ProfilerError::ToolMissing(tool.to_string())
        } else {
            ProfilerError::Io(e)
        }
    }
}

/// The kernel may be mounted at either base path depending on deployment.
fn pid_visible(pid: i32) -> bool {
    Path::new(podwatch_procfs::LOCAL_PROC)
        .join(pid.to_string())
        .is_dir()
        || Path::new(podwatch_procfs::HOST_PROC)
            .join(pid.to_string())
            .is_dir()
}

fn tempdir() -> std::io::Result<std::path::PathBuf> {
    use std::sync::atomic::{AtomicU64, Ordering};
    static SEQ: AtomicU64 = AtomicU64::new(0);

    let dir = std::env::temp_dir().join(format!(
        "podwatch-profile-{}-{}",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Parses folded stack lines into the flame tree. Every visited node's value
/// grows by the line's count, so each node's value equals the sum over its
/// descendant leaves.
pub fn build_tree(folded: &str) -> FlameNode {
    let mut root = FlameNode::root();

    for line in folded.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((stack, count)) = line.rsplit_once(' ') else {
            continue;
        };
        let Ok(count) = count.parse::<u64>() else {
            continue;
        };

        add_stack(&mut root, stack.split(';'), count);
    }

    root
}

fn add_stack<'a>(node: &mut FlameNode, mut frames: impl Iterator<Item = &'a str>, count: u64) {
    node.value += count;

    let Some(frame) = frames.next() else {
        return;
    };

    let index = match node.children.iter().position(|c| c.name == frame) {
        Some(index) => index,
        None => {
            node.children.push(FlameNode {
                name: frame.to_string(),
                value: 0,
                children: Vec::new(),
            });
            node.children.len() - 1
        }
    };
    add_stack(&mut node.children[index], frames, count);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn child<'a>(node: &'a FlameNode, name: &str) -> &'a FlameNode {
        node.children
            .iter()
            .find(|c| c.name == name)
            .unwrap_or_else(|| panic!("missing child {name}"))
    }

    #[test]
    fn tree_values_sum_leaf_counts() {
        let folded = "main;run;parse 3\nmain;run;eval 5\nmain;idle 2\n";
        let tree = build_tree(folded);

        assert_eq!(tree.name, "root");
        assert_eq!(tree.value, 10);

        let main = child(&tree, "main");
        assert_eq!(main.value, 10);

        let run = child(main, "run");
        assert_eq!(run.value, 8);
        assert_eq!(child(run, "parse").value, 3);
        assert_eq!(child(run, "eval").value, 5);
        assert_eq!(child(main, "idle").value, 2);
    }

    #[test]
    fn shared_prefixes_merge_into_one_path() {
        let folded = "a;b;c 1\na;b;d 1\na;b;c 4\n";
        let tree = build_tree(folded);

        let a = child(&tree, "a");
        assert_eq!(a.children.len(), 1);
        let b = child(a, "b");
        assert_eq!(b.children.len(), 2);
        assert_eq!(child(b, "c").value, 5);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let folded = "only_a_stack\nmain;f not_a_number\n\nmain;g 7\n";
        let tree = build_tree(folded);
        assert_eq!(tree.value, 7);
        assert_eq!(tree.children.len(), 1);
    }

    #[test]
    fn serialized_tree_omits_empty_children() {
        let tree = build_tree("a 1\n");
        let json = serde_json::to_value(&tree).unwrap();
        assert_eq!(json["name"], "root");
        assert_eq!(json["value"], 1);
        assert!(json["children"][0].get("children").is_none());
    }

    #[tokio::test]
    async fn dev_mode_returns_deterministic_placeholder() {
        let generator = FlamegraphGenerator::new(true);
        let bytes = generator.generate("n1", "web", 30, 1234).await.unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            "Mock flamegraph data for node:n1 pod:web duration:30s"
        );
    }

    #[tokio::test]
    async fn invalid_pid_fails_fast() {
        let generator = FlamegraphGenerator::new(false);
        assert!(matches!(
            generator.generate("n1", "web", 5, -1).await,
            Err(ProfilerError::InvalidPid(-1))
        ));
        assert!(matches!(
            generator.generate("n1", "web", 5, 0).await,
            Err(ProfilerError::InvalidPid(0))
        ));
    }
}
