//! Trigger-aware masking: which telescopes carry data, how many per event, and
//! which flattened recurrent output row is each event's last valid one.
//!
//! Untriggered telescopes are all-zero images. The recurrent aggregator only
//! honours a length cutoff, so within an event the triggered telescopes must
//! come first; [`is_triggered_first`] checks that on the host.
use itertools::Itertools;
use ndarray::{ArrayView4, ArrayView5, Axis};
use tensorflow::ops;
use tensorflow::DataType;
use tensorflow::Output;
use tensorflow::Scope;
use tensorflow::Status;

use crate::config::SequenceLengthSource;

/// (batch, telescope) 0/1 indicator of telescopes whose image has any non-zero pixel.
pub fn used_telescopes<O: Into<Output>>(telescope_data: O, scope: &mut Scope) -> Result<Output, Status> {
    let mut scope = scope.new_sub_scope("used_telescopes");
    let scope = &mut scope;
    let pixel_axes = ops::constant(&[2i32, 3, 4][..], scope)?;
    let peak = ops::max(ops::abs(telescope_data, scope)?, pixel_axes, scope)?;
    Ok(ops::sign(peak, scope)?.into())
}

/// Per-event int32 count from a (batch, telescope) 0/1 float indicator.
pub fn triggered_counts<O: Into<Output>>(used: O, scope: &mut Scope) -> Result<Output, Status> {
    let telescope_axis = ops::constant(1i32, scope)?;
    let total = ops::sum(used, telescope_axis, scope)?;
    Ok(ops::Cast::new()
        .DstT(DataType::Int32)
        .build(total, &mut scope.with_op_name("num_tels_triggered"))?
        .into())
}

/// Per-event sequence lengths for the recurrent aggregator.
pub fn sequence_lengths(
    source: SequenceLengthSource,
    telescope_data: Output,
    telescope_triggers: Output,
    scope: &mut Scope,
) -> Result<Output, Status> {
    match source {
        SequenceLengthSource::Pixels => {
            let used = used_telescopes(telescope_data, scope)?;
            triggered_counts(used, scope)
        }
        SequenceLengthSource::Triggers => triggered_counts(telescope_triggers, scope),
    }
}

/// Row of the flattened (batch * telescope, hidden) recurrent output holding
/// the last valid step of `event`. An event with no triggered telescopes maps
/// to its own first row.
pub fn final_output_index(event: usize, num_telescopes: usize, triggered: usize) -> usize {
    event * num_telescopes + triggered.max(1) - 1
}

/// Graph form of [`final_output_index`] for every event of the batch.
pub fn final_output_indices(counts: Output, num_telescopes: u64, scope: &mut Scope) -> Result<Output, Status> {
    let num_events = ops::size(counts.clone(), scope)?;
    let events = ops::range(
        ops::constant(0i32, scope)?,
        num_events,
        ops::constant(1i32, scope)?,
        scope,
    )?;
    let row_starts = ops::multiply(events, ops::constant(num_telescopes as i32, scope)?, scope)?;
    let last_step = ops::sub(
        ops::maximum(counts, ops::constant(1i32, scope)?, scope)?,
        ops::constant(1i32, scope)?,
        scope,
    )?;
    Ok(ops::add(row_starts, last_step, scope)?.into())
}

/// Select each event's output at its last valid step.
///
/// `outputs` is (batch, telescope, hidden) and `counts` is (batch) int32. The
/// outputs are flattened to (batch * telescope, hidden), the selected rows are
/// marked in a 0/1 partition vector built from one-hot rows, and the flat
/// tensor is split into the unselected and selected groups. The selected group
/// has exactly one row per event, in event order.
pub fn select_final_outputs(
    outputs: Output,
    counts: Output,
    num_telescopes: u64,
    hidden_size: u64,
    scope: &mut Scope,
) -> Result<Output, Status> {
    let mut scope = scope.new_sub_scope("last_output");
    let scope = &mut scope;
    let flat = ops::reshape(outputs, ops::constant(&[-1i32, hidden_size as i32][..], scope)?, scope)?;
    let indices = final_output_indices(counts.clone(), num_telescopes, scope)?;
    let num_rows = ops::multiply(
        ops::size(counts, scope)?,
        ops::constant(num_telescopes as i32, scope)?,
        scope,
    )?;
    let one_hot = ops::one_hot(
        indices,
        num_rows,
        ops::constant(1i32, scope)?,
        ops::constant(0i32, scope)?,
        scope,
    )?;
    let partitions = ops::sum(one_hot, ops::constant(0i32, scope)?, scope)?;
    let parts = ops::DynamicPartition::new()
        .num_partitions(2)
        .build(flat, partitions, scope)?;
    Ok(Output {
        operation: parts,
        index: 1,
    })
}

/// Host mirror of [`used_telescopes`] for one event's (telescope, w, l, d) images.
pub fn used_flags(event: ArrayView4<f32>) -> Vec<bool> {
    event
        .axis_iter(Axis(0))
        .map(|image| image.iter().any(|v| *v != 0.0))
        .collect()
}

/// Host mirror of the graph's per-event counts for a (batch, telescope, w, l, d) array.
pub fn host_triggered_counts(images: ArrayView5<f32>) -> Vec<usize> {
    images
        .axis_iter(Axis(0))
        .map(|event| used_flags(event).into_iter().filter(|used| *used).count())
        .collect()
}

/// True when no triggered telescope follows an untriggered one.
pub fn is_triggered_first(used: &[bool]) -> bool {
    used.iter().tuple_windows().all(|(a, b)| *a || !*b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::known_shape;
    use ndarray::Array5;
    use rand::Rng;
    use tensorflow::Session;
    use tensorflow::SessionOptions;
    use tensorflow::SessionRunArgs;
    use tensorflow::Tensor;

    fn random_images(batch: usize, telescopes: usize) -> Array5<f32> {
        let mut rng = rand::thread_rng();
        Array5::from_shape_fn((batch, telescopes, 3, 3, 2), |_| rng.gen_range(0.1f32..5.0))
    }

    fn graph_counts(images: &Array5<f32>) -> Vec<i32> {
        let mut scope = Scope::new_root_scope();
        let dims: Vec<u64> = images.shape().iter().map(|d| *d as u64).collect();
        let data = ops::Placeholder::new()
            .dtype(DataType::Float)
            .shape(known_shape(&dims))
            .build(&mut scope.with_op_name("telescope_data"))
            .unwrap();
        let used = used_telescopes(data.clone(), &mut scope).unwrap();
        let counts = triggered_counts(used, &mut scope).unwrap();
        let session = Session::new(&SessionOptions::new(), &scope.graph()).unwrap();
        let feed = Tensor::<f32>::new(&dims)
            .with_values(&images.iter().cloned().collect::<Vec<_>>())
            .unwrap();
        let mut run = SessionRunArgs::new();
        run.add_feed(&data, 0, &feed);
        let fetch = run.request_fetch(&counts.operation, counts.index);
        session.run(&mut run).unwrap();
        let counts: Tensor<i32> = run.fetch(fetch).unwrap();
        counts.to_vec()
    }

    #[test]
    fn all_triggered_counts_every_telescope() {
        let images = random_images(4, 5);
        assert_eq!(graph_counts(&images), vec![5; 4]);
        assert_eq!(host_triggered_counts(images.view()), vec![5; 4]);
    }

    #[test]
    fn zeroed_telescopes_are_not_counted() {
        let mut images = random_images(3, 5);
        // event 0 loses two telescopes, event 2 loses all of them
        images.slice_mut(ndarray::s![0, 3.., .., .., ..]).fill(0.0);
        images.slice_mut(ndarray::s![2, .., .., .., ..]).fill(0.0);
        assert_eq!(graph_counts(&images), vec![3, 5, 0]);
        assert_eq!(host_triggered_counts(images.view()), vec![3, 5, 0]);
    }

    #[test]
    fn final_index_arithmetic() {
        assert_eq!(final_output_index(2, 5, 3), 12);
        assert_eq!(final_output_index(0, 5, 5), 4);
        assert_eq!(final_output_index(1, 3, 0), 3);
    }

    #[test]
    fn selects_last_valid_row_per_event() {
        let (batch, telescopes, hidden) = (3u64, 4u64, 2u64);
        let mut scope = Scope::new_root_scope();
        let values: Vec<f32> = (0..batch * telescopes * hidden).map(|v| v as f32).collect();
        let outputs = ops::constant(
            Tensor::<f32>::new(&[batch, telescopes, hidden]).with_values(&values).unwrap(),
            &mut scope,
        )
        .unwrap();
        let counts = ops::constant(&[2i32, 4, 0][..], &mut scope).unwrap();
        let selected =
            select_final_outputs(outputs.into(), counts.into(), telescopes, hidden, &mut scope).unwrap();
        let session = Session::new(&SessionOptions::new(), &scope.graph()).unwrap();
        let mut run = SessionRunArgs::new();
        let fetch = run.request_fetch(&selected.operation, selected.index);
        session.run(&mut run).unwrap();
        let selected: Tensor<f32> = run.fetch(fetch).unwrap();
        assert_eq!(selected.dims(), &[3, 2]);
        // rows 1, 7 and 8 of the flattened outputs
        assert_eq!(selected.to_vec(), vec![2.0, 3.0, 14.0, 15.0, 16.0, 17.0]);
    }

    #[test]
    fn ordering_check() {
        assert!(is_triggered_first(&[true, true, false, false]));
        assert!(is_triggered_first(&[false, false]));
        assert!(is_triggered_first(&[]));
        assert!(!is_triggered_first(&[true, false, true]));
    }
}
