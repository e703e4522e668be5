//! Snapshot framing: a header identifying the projection, then the
//! projection's own payload.

use serde::{Deserialize, Serialize};

/// Identification header written ahead of every snapshot body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    /// The projection's full name.
    pub name: String,
    /// State-type identifier of the projection that wrote the snapshot.
    pub state_type: String,
    /// Sequence of the last event folded into the snapshotted state.
    pub sequence: u32,
}

/// Frame `body` behind a length-prefixed header.
pub fn frame_snapshot(header: &SnapshotHeader, body: &[u8]) -> anyhow::Result<Vec<u8>> {
    let head = rmp_serde::to_vec_named(header)?;
    let mut out = Vec::with_capacity(4 + head.len() + body.len());
    out.extend_from_slice(&(head.len() as u32).to_le_bytes());
    out.extend_from_slice(&head);
    out.extend_from_slice(body);
    Ok(out)
}

/// Split a framed snapshot into its header and body.
pub fn parse_snapshot(bytes: &[u8]) -> anyhow::Result<(SnapshotHeader, &[u8])> {
    let Some(raw_len) = bytes.get(..4) else {
        anyhow::bail!("snapshot shorter than its header length prefix");
    };
    let mut prefix = [0u8; 4];
    prefix.copy_from_slice(raw_len);
    let head_len = u32::from_le_bytes(prefix) as usize;
    let Some(head) = bytes.get(4..4 + head_len) else {
        anyhow::bail!("snapshot header length {head_len} overruns {} bytes", bytes.len());
    };
    let header: SnapshotHeader = rmp_serde::from_slice(head)?;
    Ok((header, &bytes[4 + head_len..]))
}
