//! Delta-base selection: skip-delta with a linear tail.
//!
//! Delta chains use skip-delta bits for the high-order part of a node's
//! history and are linear in the low-order part: clearing the lowest set
//! bit of the predecessor count names the skip-delta ancestor, while
//! histories closer to HEAD than `max_linear_deltification` delta against
//! their immediate predecessor to keep deltas small.

use fsvn_error::{FsError, Result};
use fsvn_types::{NodeRevision, Representation};

use crate::fs::FileSystem;
use crate::nodes;
use crate::rep_read;

/// Pick the representation to delta against when writing `noderev`'s data
/// (or, with `props`, property) representation. `None` starts a fresh
/// chain.
pub fn choose_delta_base(
    fs: &FileSystem,
    noderev: &NodeRevision,
    props: bool,
) -> Result<Option<Representation>> {
    let p = noderev.predecessor_count;
    if p == 0 {
        return Ok(None);
    }

    // Clearing the rightmost '1' bit of the predecessor count names the
    // ancestor we want, counting file revs from 0.
    let mut count = p & (p - 1);
    let walk = p - count;

    // Finding a base over a very long distance gets expensive for deep
    // histories; past the ceiling, simply start a fresh chain.
    if walk > fs.config().max_deltification_walk {
        return Ok(None);
    }

    // Close to HEAD, use linear history to minimize delta size.
    if walk < fs.config().max_linear_deltification {
        count = p - 1;
    }

    // Walk back p - count predecessor hops.
    let mut base = noderev.clone();
    let mut maybe_shared_rep = false;
    for _ in count..p {
        let pred = base.predecessor_id.ok_or_else(|| {
            FsError::corrupt(format!(
                "predecessor chain of '{}' ends after {} of {} hops",
                noderev.id, base.predecessor_count, p
            ))
        })?;
        base = nodes::get_node_revision(fs, &pred)?;

        // A rep written in an older revision than its carrier node-rev may
        // be shared; shared reps sit on a different parent chain. Copied
        // nodes look the same (false positive), same-revision sharing is
        // not caught (false negative).
        let rep = if props { &base.prop_rep } else { &base.data_rep };
        if let (Some(carrier_rev), Some(rep)) = (base.id.revision(), rep) {
            if rep
                .id
                .change_set
                .revision()
                .is_some_and(|rep_rev| carrier_rev > rep_rev)
            {
                maybe_shared_rep = true;
            }
        }
    }

    let rep = if props {
        base.prop_rep.clone()
    } else {
        base.data_rep.clone()
    };

    if let Some(rep) = &rep {
        if maybe_shared_rep {
            // The shared rep's own chain may be longer than the node-rev
            // chain suggests; measure it and bail out past the bound.
            let chain_length = rep_read::rep_chain_length(fs, rep)?;
            if chain_length >= 2 * fs.config().max_linear_deltification + 2 {
                return Ok(None);
            }
        }
    }

    Ok(rep)
}
