//! Turns raw point batches into a persisted octree.
//!
//! Every incoming batch is reprojected, deduplicated and cut into pieces of at most
//! [`ImportConfig::max_batch_point_count`] points. Each piece is thinned out within its own cell
//! and built into a temporary tree, and all trees are then merged pairwise in parallel. Only the
//! final tree is written to [`ImportConfig::storage`].

use itertools::Itertools;
use rayon::prelude::*;

use crate::{
    batch::PointBatch,
    config::ImportConfig,
    error::{Error, Result},
    merge::MergeEngine,
    node::{visit::TreeStats, OctreeNode, PointCloudNode},
};

/// Imports all `batches` into a single durable tree.
///
/// Returns [`None`] if the batches do not contain a single point. Fails with [`Error::Cancelled`]
/// once [`ImportConfig::cancel`] was called, which is checked between batches.
pub fn import(
    batches: impl IntoIterator<Item = PointBatch>,
    config: &ImportConfig,
) -> Result<Option<OctreeNode>> {
    config.validate()?;
    let pieces = batches
        .into_iter()
        .map(|batch| prepare(batch, config))
        .flatten_ok()
        .collect::<Result<Vec<_>>>()?;

    match config.thread_pool()? {
        Some(pool) => pool.install(|| import_pieces(pieces, config)),
        None => import_pieces(pieces, config),
    }
}

/// Imports a single batch, see [`import`].
pub fn import_points(points: PointBatch, config: &ImportConfig) -> Result<Option<OctreeNode>> {
    import([points], config)
}

fn import_pieces(pieces: Vec<PointBatch>, config: &ImportConfig) -> Result<Option<OctreeNode>> {
    let engine = MergeEngine::new(config);
    let piece_count = pieces.len();
    let Some(root) = pieces
        .into_par_iter()
        .map(|piece| build_tree(piece, config))
        .filter_map(Result::transpose)
        .try_reduce_with(|a, b| {
            check_cancelled(config)?;
            engine.merge(&a, &b)
        })
        .transpose()?
    else {
        return Ok(None);
    };

    check_cancelled(config)?;
    engine.progress().report(root.point_count_tree());
    let root = root.persist(&config.storage)?;
    if config.verbose {
        let stats = TreeStats::of(&root)?;
        log::info!(
            "imported {} points from {piece_count} batches into {} nodes ({} leaves, depth {}..={}, \
             at most {} points per leaf)",
            stats.point_count,
            stats.node_count,
            stats.leaf_count,
            stats.min_depth,
            stats.max_depth,
            stats.max_leaf_points,
        );
    }
    Ok(Some(root))
}

/// Reprojects and deduplicates `batch` and cuts it into pieces small enough to be built at once.
fn prepare(batch: PointBatch, config: &ImportConfig) -> Result<Vec<PointBatch>> {
    check_cancelled(config)?;
    if batch.is_empty() {
        return Ok(Vec::new());
    }
    let batch = match &config.reproject {
        Some(reproject) => batch.map_positions(|positions| reproject(positions))?,
        None => batch,
    };
    let batch = if config.deduplicate_batches {
        let (deduplicated, removed) = batch.deduplicate(config.verbose);
        if removed > 0 {
            log::debug!("removed {removed} duplicate points");
        }
        deduplicated
    } else {
        batch
    };
    let pieces = batch.split(config.max_batch_point_count)?.collect();
    Ok(pieces)
}

/// Thins out `piece` within its own cell and builds a temporary tree from the remaining points.
fn build_tree(piece: PointBatch, config: &ImportConfig) -> Result<Option<OctreeNode>> {
    check_cancelled(config)?;
    let Some(cell) = piece.cell() else {
        return Ok(None);
    };
    let points = piece.filter_min_distance(cell, config.min_dist, config.verbose);
    OctreeNode::build(cell, points, config.split_limit).map(Some)
}

fn check_cancelled(config: &ImportConfig) -> Result<()> {
    if config.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}
