//! Cluster-wide scans.
//!
//! A scan builds one immutable command buffer, leases every node in the
//! cluster, and streams record responses back through a caller-supplied
//! callback. Workers run in parallel (one task per node, results collected
//! over a completion channel) or serially. Cancellation is cooperative: the
//! first failing worker wins an atomic latch and its peers stop between
//! records. A scan never duns a node for scan-level disagreements; only
//! transport failures touch node health.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use strata_core::command::{CommandBuffer, ScanPriority};
use strata_core::msg::{field_type, result_code, MsgHeader, INFO1_NOBINDATA, INFO1_READ, INFO2_WRITE};
use strata_core::proto::{FrameHeader, FRAME_HEADER_SIZE};
use strata_core::{encode_arglist, parse_record, Record};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::cluster::{Cluster, DunReason, Node, Reservation};
use crate::error::ClientError;

// ---------------------------------------------------------------------------
// Scan descriptor and policy
// ---------------------------------------------------------------------------

/// A server-side function applied to each scanned record.
#[derive(Debug, Clone)]
pub struct UdfCall {
    pub module: String,
    pub function: String,
    pub args: Vec<rmpv::Value>,
}

/// What to scan and how to stream it.
#[derive(Debug, Clone)]
pub struct ScanSpec {
    pub namespace: String,
    /// Restrict the scan to one set, or scan the whole namespace.
    pub set: Option<String>,
    pub priority: ScanPriority,
    /// Percentage of records to sample, 1..=100.
    pub percent: u8,
    /// Run one worker per node in parallel rather than node-by-node.
    pub concurrent: bool,
    /// Ask the server to omit bin data (metadata-only scan).
    pub no_bins: bool,
    /// Restrict returned bins by name; empty means all bins.
    pub bin_names: Vec<String>,
    /// Optional UDF applied server-side to each record.
    pub apply: Option<UdfCall>,
}

impl ScanSpec {
    /// A full scan of `namespace` with default options.
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            set: None,
            priority: ScanPriority::Auto,
            percent: 100,
            concurrent: false,
            no_bins: false,
            bin_names: Vec::new(),
            apply: None,
        }
    }
}

/// Per-scan policy knobs.
#[derive(Debug, Clone)]
pub struct ScanPolicy {
    /// Per-request deadline in milliseconds; zero means no deadline.
    pub timeout_ms: u32,
    /// Fail the scan if the cluster rebalances while it runs.
    pub fail_on_cluster_change: bool,
}

impl Default for ScanPolicy {
    fn default() -> Self {
        Self {
            timeout_ms: 0,
            fail_on_cluster_change: false,
        }
    }
}

/// Record callback: `Some(record)` per streamed record, then `None` once
/// the whole scan has drained. Returning `false` aborts the scan; abort is
/// not an error.
type SharedCallback = Arc<Mutex<dyn FnMut(Option<&Record>) -> bool + Send>>;

// ---------------------------------------------------------------------------
// Public entry points
// ---------------------------------------------------------------------------

/// Scans every node in the cluster, streaming records to `callback`.
///
/// On success the callback is invoked one final time with `None` to signal
/// end-of-stream. A `false` return from the callback stops the scan early
/// and is reported as success.
///
/// # Errors
///
/// [`ClientError::ClusterEmpty`] when no nodes are known; otherwise the
/// first node failure, after all workers have stopped.
pub async fn scan_foreach<F>(
    cluster: &Cluster,
    policy: &ScanPolicy,
    spec: &ScanSpec,
    callback: F,
) -> Result<(), ClientError>
where
    F: FnMut(Option<&Record>) -> bool + Send + 'static,
{
    let callback: SharedCallback = Arc::new(Mutex::new(callback));
    scan_generic(cluster, policy, spec, Some(callback), None)
        .await
        .map(|_| ())
}

/// Starts a scan and returns its task id without streaming records back.
/// The server runs the scan in the background; the id can be used to query
/// its status later.
///
/// A caller-supplied non-zero `task_id` is used as-is; zero or `None`
/// generates one.
///
/// # Errors
///
/// Same as [`scan_foreach`].
pub async fn scan_background(
    cluster: &Cluster,
    policy: &ScanPolicy,
    spec: &ScanSpec,
    task_id: Option<u64>,
) -> Result<u64, ClientError> {
    scan_generic(cluster, policy, spec, None, task_id).await
}

/// Scans a single node, selected by its server-reported name.
///
/// # Errors
///
/// [`ClientError::NoNode`] when no node with that name exists; otherwise as
/// [`scan_foreach`].
pub async fn scan_node<F>(
    cluster: &Cluster,
    policy: &ScanPolicy,
    spec: &ScanSpec,
    node_name: &str,
    callback: F,
) -> Result<(), ClientError>
where
    F: FnMut(Option<&Record>) -> bool + Send + 'static,
{
    let _req = cluster.request_guard();
    let node = cluster.node_by_name(node_name).ok_or(ClientError::NoNode)?;

    let task_id = rand::random::<u64>() >> 1;
    let cmd = build_scan_command(policy, spec, task_id)?;
    let callback: SharedCallback = Arc::new(Mutex::new(callback));
    let abort = Arc::new(AtomicU32::new(0));
    let first_error = Arc::new(Mutex::new(None));

    let status = run_node_scan(&node, &cmd, policy, Some(&callback), &abort, &first_error).await;
    debug!(node = %node.name(), status = ?status, "node scan complete");
    drop(node);

    let overall = match first_error.lock().take() {
        Some(err) => Err(err),
        None => Ok(()),
    };
    finish_scan(overall, Some(&callback))
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

struct NodeScanOutcome {
    node_name: String,
    status: WorkerStatus,
}

/// Per-node completion report. `Failed` carries no payload: the winning
/// worker already moved its error into the shared slot, and losers' errors
/// are dropped just like their records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerStatus {
    Ok,
    Failed,
    Aborted,
}

async fn scan_generic(
    cluster: &Cluster,
    policy: &ScanPolicy,
    spec: &ScanSpec,
    callback: Option<SharedCallback>,
    task_id: Option<u64>,
) -> Result<u64, ClientError> {
    let _req = cluster.request_guard();

    let nodes = cluster.reserve_all_nodes();
    if nodes.is_empty() {
        return Err(ClientError::ClusterEmpty);
    }

    let task_id = match task_id {
        Some(id) if id != 0 => id,
        _ => rand::random::<u64>() >> 1,
    };
    let cmd = build_scan_command(policy, spec, task_id)?;

    let abort = Arc::new(AtomicU32::new(0));
    let first_error: Arc<Mutex<Option<ClientError>>> = Arc::new(Mutex::new(None));

    if spec.concurrent {
        let n_nodes = nodes.len();
        let (tx, mut rx) = mpsc::channel::<NodeScanOutcome>(n_nodes);

        for node in nodes {
            let cmd = cmd.clone();
            let policy = policy.clone();
            let callback = callback.clone();
            let abort = Arc::clone(&abort);
            let first_error = Arc::clone(&first_error);
            let tx = tx.clone();
            tokio::spawn(async move {
                let status = run_node_scan(
                    &node,
                    &cmd,
                    &policy,
                    callback.as_ref(),
                    &abort,
                    &first_error,
                )
                .await;
                let _ = tx
                    .send(NodeScanOutcome {
                        node_name: node.name().to_string(),
                        status,
                    })
                    .await;
                // `node` drops here, releasing the scan's lease.
            });
        }
        drop(tx);

        for _ in 0..n_nodes {
            let Some(outcome) = rx.recv().await else { break };
            debug!(
                node = %outcome.node_name,
                status = ?outcome.status,
                "node scan complete"
            );
        }
    } else {
        for node in &nodes {
            let status = run_node_scan(
                node,
                &cmd,
                policy,
                callback.as_ref(),
                &abort,
                &first_error,
            )
            .await;
            debug!(node = %node.name(), status = ?status, "node scan complete");
            if status != WorkerStatus::Ok {
                break;
            }
        }
        drop(nodes);
    }

    let overall = {
        let taken = first_error.lock().take();
        match taken {
            Some(err) => Err(err),
            None => Ok(()),
        }
    };
    finish_scan(overall, callback.as_ref())?;
    Ok(task_id)
}

/// Final bookkeeping shared by every entry point: a user abort is success,
/// and a successful foreground scan signals end-of-stream with `None`.
fn finish_scan(
    overall: Result<(), ClientError>,
    callback: Option<&SharedCallback>,
) -> Result<(), ClientError> {
    match overall {
        Ok(()) => {
            if let Some(cb) = callback {
                let _ = (cb.lock())(None);
            }
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Runs one node's scan and settles the abort latch on failure.
///
/// The first failing worker wins the latch and moves its error into the
/// shared slot (unless the "error" is the user's own abort). Later failures
/// keep their mouths shut; their workers just stop.
async fn run_node_scan(
    node: &Reservation<Node>,
    cmd: &Bytes,
    policy: &ScanPolicy,
    callback: Option<&SharedCallback>,
    abort: &AtomicU32,
    first_error: &Arc<Mutex<Option<ClientError>>>,
) -> WorkerStatus {
    match scan_connection(node, cmd, policy, callback, abort).await {
        Ok(()) => WorkerStatus::Ok,
        Err(err) => {
            let won = abort
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
            let aborted = matches!(err, ClientError::ClientAbort);
            if won && !aborted {
                *first_error.lock() = Some(err);
            } else {
                debug!(node = %node.name(), error = %err, "node scan stopped");
            }
            if aborted {
                WorkerStatus::Aborted
            } else {
                WorkerStatus::Failed
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Per-node connection loop
// ---------------------------------------------------------------------------

async fn scan_connection(
    node: &Node,
    cmd: &Bytes,
    policy: &ScanPolicy,
    callback: Option<&SharedCallback>,
    abort: &AtomicU32,
) -> Result<(), ClientError> {
    let deadline = if policy.timeout_ms == 0 {
        None
    } else {
        Some(Instant::now() + Duration::from_millis(u64::from(policy.timeout_ms)))
    };

    // Checkout duns on its own failures; no double-dun here.
    let mut stream = node.checkout().await?;

    if let Err(err) = write_all_deadline(&mut stream, cmd, deadline).await {
        dun_for_transport(node, &err);
        return Err(err);
    }

    loop {
        let mut header_bytes = [0u8; FRAME_HEADER_SIZE];
        if let Err(err) = read_exact_deadline(&mut stream, &mut header_bytes, deadline).await {
            dun_for_transport(node, &err);
            return Err(err);
        }
        let frame = FrameHeader::decode(header_bytes)?;
        if frame.size == 0 {
            continue;
        }

        #[allow(clippy::cast_possible_truncation)]
        let mut payload = vec![0u8; frame.size as usize];
        if let Err(err) = read_exact_deadline(&mut stream, &mut payload, deadline).await {
            dun_for_transport(node, &err);
            return Err(err);
        }

        if parse_group(&payload, callback, abort)? {
            // Clean end of this node's stream: the connection is reusable.
            node.checkin(stream);
            return Ok(());
        }
    }
}

/// Transport failures on a running operation count against node health.
/// Protocol disagreements and aborts do not.
fn dun_for_transport(node: &Node, err: &ClientError) {
    match err {
        ClientError::Io(_) => node.dun(DunReason::NetworkError),
        ClientError::Timeout => node.dun(DunReason::UserTimeout),
        _ => {}
    }
}

/// Parses one response group. Returns `Ok(true)` when the node's stream is
/// done (LAST flag or NOT_FOUND), `Ok(false)` to keep reading groups.
fn parse_group(
    mut buf: &[u8],
    callback: Option<&SharedCallback>,
    abort: &AtomicU32,
) -> Result<bool, ClientError> {
    while !buf.is_empty() {
        let header = MsgHeader::decode_from(&mut buf)?;

        if header.result_code != result_code::OK {
            // A scan over a set absent from this node answers NOT_FOUND;
            // that is "no more records", not a failure.
            if header.result_code == result_code::NOT_FOUND {
                return Ok(true);
            }
            return Err(ClientError::Server(header.result_code));
        }
        if header.is_last() {
            return Ok(true);
        }

        let record = parse_record(&mut buf, &header)?;
        if let Some(cb) = callback {
            if !(cb.lock())(Some(&record)) {
                return Err(ClientError::ClientAbort);
            }
        }
        if abort.load(Ordering::Acquire) != 0 {
            return Err(ClientError::ScanAborted);
        }
    }
    Ok(false)
}

async fn write_all_deadline(
    stream: &mut TcpStream,
    data: &[u8],
    deadline: Option<Instant>,
) -> Result<(), ClientError> {
    match deadline {
        Some(deadline) => {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(ClientError::Timeout)?;
            match tokio::time::timeout(remaining, stream.write_all(data)).await {
                Ok(result) => result.map_err(ClientError::from),
                Err(_) => Err(ClientError::Timeout),
            }
        }
        None => stream.write_all(data).await.map_err(ClientError::from),
    }
}

async fn read_exact_deadline(
    stream: &mut TcpStream,
    buf: &mut [u8],
    deadline: Option<Instant>,
) -> Result<(), ClientError> {
    match deadline {
        Some(deadline) => {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(ClientError::Timeout)?;
            match tokio::time::timeout(remaining, stream.read_exact(buf)).await {
                Ok(result) => result.map(|_| ()).map_err(ClientError::from),
                Err(_) => Err(ClientError::Timeout),
            }
        }
        None => stream
            .read_exact(buf)
            .await
            .map(|_| ())
            .map_err(ClientError::from),
    }
}

// ---------------------------------------------------------------------------
// Command assembly
// ---------------------------------------------------------------------------

/// Builds the scan command buffer shared by every worker. Scans have no
/// retries, so the buffer never changes once built.
fn build_scan_command(
    policy: &ScanPolicy,
    spec: &ScanSpec,
    task_id: u64,
) -> Result<Bytes, ClientError> {
    let mut n_fields: u16 = 3; // namespace + scan options + task id
    if spec.set.as_deref().is_some_and(|s| !s.is_empty()) {
        n_fields += 1;
    }
    if spec.apply.is_some() {
        n_fields += 4;
    }

    // Bin selectors are written only for plain scans; names that cannot fit
    // the one-byte length prefix are dropped before the op count is fixed.
    let bins: Vec<&str> = if spec.apply.is_some() {
        Vec::new()
    } else {
        spec.bin_names
            .iter()
            .filter(|name| {
                let fits = name.len() <= usize::from(u8::MAX);
                if !fits {
                    warn!(bin = %name, "bin name too long, skipping selector");
                }
                fits
            })
            .map(String::as_str)
            .collect()
    };

    let (info1, info2) = if spec.apply.is_some() {
        (INFO1_READ, INFO2_WRITE)
    } else {
        let mut info1 = INFO1_READ;
        if spec.no_bins {
            info1 |= INFO1_NOBINDATA;
        }
        (info1, 0)
    };
    #[allow(clippy::cast_possible_truncation)]
    let n_ops = bins.len() as u16;

    let header = MsgHeader {
        info1,
        info2,
        transaction_ttl: policy.timeout_ms,
        n_fields,
        n_ops,
        ..MsgHeader::default()
    };

    let mut cmd = CommandBuffer::new(&header);
    cmd.field_str(field_type::NAMESPACE, &spec.namespace);
    if let Some(set) = spec.set.as_deref().filter(|s| !s.is_empty()) {
        cmd.field_str(field_type::SETNAME, set);
    }
    cmd.scan_options(spec.priority, policy.fail_on_cluster_change, spec.percent);
    cmd.field_u64(field_type::TASK_ID, task_id);

    if let Some(udf) = &spec.apply {
        cmd.field_bytes(field_type::UDF_OP, &[2]);
        cmd.field_str(field_type::UDF_PACKAGE_NAME, &udf.module);
        cmd.field_str(field_type::UDF_FUNCTION, &udf.function);
        cmd.field_bytes(field_type::UDF_ARGLIST, &encode_arglist(&udf.args)?);
    }

    for name in bins {
        cmd.bin_name(name);
    }

    Ok(cmd.finish()?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
