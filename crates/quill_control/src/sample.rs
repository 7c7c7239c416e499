//! Sampling detached replicas and computing the chunk assignment.
//!
//! Every document on every detached replica is read projected to the
//! old and new key fields. The scan yields a numeric domain estimate
//! for the new key's first field; the domain is cut into equal-width
//! chunks and each chunk is assigned to the group whose detached
//! replica already holds the plurality of its documents, minimizing
//! bytes moved during migration.

use std::sync::Arc;

use futures_util::future::join_all;

use crate::client::NodeClient;
use crate::error::{ControlError, ControlResult};
use crate::keys::KeyPattern;
use crate::{Document, Endpoint};

/// Scalar numeric domain of the new key's first field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DomainEstimate {
    pub min: f64,
    pub max: f64,
    /// `ceil(max - min + 1)`: distinct slots the key can occupy.
    pub cardinality: u64,
}

impl DomainEstimate {
    fn empty() -> Self {
        Self {
            min: 0.0,
            max: 0.0,
            cardinality: 0,
        }
    }
}

/// Documents seen on the detached replicas, one vec per group.
#[derive(Debug)]
pub struct SampleSet {
    pub per_group: Vec<Vec<Document>>,
    pub domain: DomainEstimate,
}

/// The computed chunk layout and owners.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub num_chunks: usize,
    /// Key-domain width of each chunk.
    pub range_per_chunk: u64,
    /// `owners[i]` is the group index owning chunk `i`.
    pub owners: Vec<usize>,
    /// `counts[i][g]`: sampled docs in chunk `i` seen on group `g`.
    pub counts: Vec<Vec<u64>>,
}

/// Read every document from each detached replica, projected to the
/// old and new key fields, tracking the new key's numeric min/max.
pub async fn scan_detached(
    client: Arc<dyn NodeClient>,
    ns: &str,
    detached: &[Endpoint],
    old_key: &KeyPattern,
    new_key: &KeyPattern,
) -> ControlResult<SampleSet> {
    let fields: Vec<String> = old_key
        .field_names()
        .chain(new_key.field_names())
        .map(str::to_string)
        .collect();

    let scans = detached.iter().map(|ep| {
        let client = client.clone();
        let fields = fields.clone();
        let ep = ep.clone();
        let ns = ns.to_string();
        async move { client.scan_projected(&ep, &ns, &fields).await }
    });
    let results: Vec<Vec<Document>> = join_all(scans)
        .await
        .into_iter()
        .collect::<ControlResult<_>>()?;

    let mut min = f64::MAX;
    let mut max = f64::MIN;
    let mut seen = 0u64;
    for docs in &results {
        for doc in docs {
            let value = new_key.first_value_numeric(doc)?;
            min = min.min(value);
            max = max.max(value);
            seen += 1;
        }
    }

    let domain = if seen == 0 {
        DomainEstimate::empty()
    } else {
        DomainEstimate {
            min,
            max,
            cardinality: (max - min + 1.0).ceil() as u64,
        }
    };
    tracing::info!(ns, documents = seen, min = domain.min, max = domain.max,
        cardinality = domain.cardinality, "sampled detached replicas");

    Ok(SampleSet {
        per_group: results,
        domain,
    })
}

/// Chunk index for one key value: `floor(value / range)` clamped into
/// the end-cap chunks.
pub fn chunk_position(value: f64, range_per_chunk: u64, num_chunks: usize) -> usize {
    let pos = (value / range_per_chunk.max(1) as f64).floor();
    if pos < 0.0 {
        0
    } else {
        (pos as usize).min(num_chunks - 1)
    }
}

/// Build the count matrix and pick each chunk's owner by plurality,
/// breaking ties toward the lowest group index.
pub fn build_assignment(
    samples: &SampleSet,
    new_key: &KeyPattern,
    num_chunks: usize,
) -> ControlResult<Assignment> {
    if num_chunks == 0 {
        return Err(ControlError::validation("chunk count must be at least 1"));
    }
    let num_groups = samples.per_group.len();
    let range_per_chunk = samples
        .domain
        .cardinality
        .div_ceil(num_chunks as u64)
        .max(1);

    let mut counts = vec![vec![0u64; num_groups]; num_chunks];
    for (group, docs) in samples.per_group.iter().enumerate() {
        for doc in docs {
            let value = new_key.first_value_numeric(doc)?;
            counts[chunk_position(value, range_per_chunk, num_chunks)][group] += 1;
        }
    }

    let owners = counts
        .iter()
        .map(|row| {
            let mut owner = 0usize;
            let mut best = 0u64;
            for (group, count) in row.iter().enumerate() {
                if *count > best {
                    best = *count;
                    owner = group;
                }
            }
            owner
        })
        .collect();

    Ok(Assignment {
        num_chunks,
        range_per_chunk,
        owners,
        counts,
    })
}
