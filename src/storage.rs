//! Output sinks that keep the trace in memory.

use anyhow::{bail, Result};
use arrow::{
    array::{
        Array, ArrayBuilder, ArrayRef, BooleanBuilder, FixedSizeListBuilder, Float64Builder,
        Int64Builder, StructArray, UInt64Builder,
    },
    datatypes::Field,
};

use crate::sampler::{SampleRecord, SampleSink};

impl SampleSink for Vec<SampleRecord> {
    fn append(&mut self, record: &SampleRecord) -> Result<()> {
        self.push(record.clone());
        Ok(())
    }
}

/// Collects the draws and sampler diagnostics of a chain into arrow
/// columns.
///
/// The draws end up in a `FixedSizeList<Float64>` column `draws`, the start
/// and end of divergent trajectories in nullable list columns, and every
/// scalar diagnostic in its own column.
pub struct ArrowTraceSink {
    dim: usize,
    draws: FixedSizeListBuilder<Float64Builder>,
    divergence_start: FixedSizeListBuilder<Float64Builder>,
    divergence_end: FixedSizeListBuilder<Float64Builder>,
    chain: UInt64Builder,
    draw: UInt64Builder,
    tuning: BooleanBuilder,
    logp: Float64Builder,
    energy: Float64Builder,
    energy_error: Float64Builder,
    step_size: Float64Builder,
    step_size_bar: Float64Builder,
    depth: UInt64Builder,
    n_steps: UInt64Builder,
    maxdepth_reached: BooleanBuilder,
    diverging: BooleanBuilder,
    accept_stat: Float64Builder,
    index_in_trajectory: Int64Builder,
}

fn vector_builder(dim: usize) -> FixedSizeListBuilder<Float64Builder> {
    FixedSizeListBuilder::new(Float64Builder::new(), dim as _)
}

fn append_optional(
    builder: &mut FixedSizeListBuilder<Float64Builder>,
    dim: usize,
    value: Option<&[f64]>,
) {
    match value {
        Some(value) if value.len() == dim => {
            builder.values().append_slice(value);
            builder.append(true);
        }
        _ => {
            builder.values().append_nulls(dim);
            builder.append(false);
        }
    }
}

impl ArrowTraceSink {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            draws: vector_builder(dim),
            divergence_start: vector_builder(dim),
            divergence_end: vector_builder(dim),
            chain: UInt64Builder::new(),
            draw: UInt64Builder::new(),
            tuning: BooleanBuilder::new(),
            logp: Float64Builder::new(),
            energy: Float64Builder::new(),
            energy_error: Float64Builder::new(),
            step_size: Float64Builder::new(),
            step_size_bar: Float64Builder::new(),
            depth: UInt64Builder::new(),
            n_steps: UInt64Builder::new(),
            maxdepth_reached: BooleanBuilder::new(),
            diverging: BooleanBuilder::new(),
            accept_stat: Float64Builder::new(),
            index_in_trajectory: Int64Builder::new(),
        }
    }

    /// The number of stored draws.
    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Finish all columns and combine them into one struct array with a
    /// row per draw.
    pub fn finalize(mut self) -> Result<StructArray> {
        let columns: Vec<(&str, ArrayRef, bool)> = vec![
            ("chain", ArrayBuilder::finish(&mut self.chain), false),
            ("draw", ArrayBuilder::finish(&mut self.draw), false),
            ("tuning", ArrayBuilder::finish(&mut self.tuning), false),
            ("draws", ArrayBuilder::finish(&mut self.draws), false),
            ("logp", ArrayBuilder::finish(&mut self.logp), false),
            ("energy", ArrayBuilder::finish(&mut self.energy), false),
            ("energy_error", ArrayBuilder::finish(&mut self.energy_error), false),
            ("step_size", ArrayBuilder::finish(&mut self.step_size), false),
            ("step_size_bar", ArrayBuilder::finish(&mut self.step_size_bar), false),
            ("depth", ArrayBuilder::finish(&mut self.depth), false),
            ("n_steps", ArrayBuilder::finish(&mut self.n_steps), false),
            ("maxdepth_reached", ArrayBuilder::finish(&mut self.maxdepth_reached), false),
            ("diverging", ArrayBuilder::finish(&mut self.diverging), false),
            ("accept_stat", ArrayBuilder::finish(&mut self.accept_stat), false),
            (
                "index_in_trajectory",
                ArrayBuilder::finish(&mut self.index_in_trajectory),
                false,
            ),
            ("divergence_start", ArrayBuilder::finish(&mut self.divergence_start), true),
            ("divergence_end", ArrayBuilder::finish(&mut self.divergence_end), true),
        ];

        let (fields, arrays): (Vec<_>, Vec<_>) = columns
            .into_iter()
            .map(|(name, array, nullable)| {
                let field = Field::new(name, array.data_type().clone(), nullable);
                (field, array)
            })
            .unzip();

        Ok(StructArray::try_new(fields.into(), arrays, None)?)
    }
}

impl SampleSink for ArrowTraceSink {
    fn append(&mut self, record: &SampleRecord) -> Result<()> {
        if record.position.len() != self.dim {
            bail!(
                "Draw of chain {} has dimension {}, but the trace stores {} values per draw",
                record.chain,
                record.position.len(),
                self.dim
            );
        }
        self.draws.values().append_slice(&record.position);
        self.draws.append(true);

        let divergence = record.divergence.as_ref();
        append_optional(
            &mut self.divergence_start,
            self.dim,
            divergence.and_then(|info| info.start_location.as_deref()),
        );
        append_optional(
            &mut self.divergence_end,
            self.dim,
            divergence.and_then(|info| info.end_location.as_deref()),
        );

        self.chain.append_value(record.chain);
        self.draw.append_value(record.draw);
        self.tuning.append_value(record.tuning);
        self.logp.append_value(record.logp);
        self.energy.append_value(record.energy);
        self.energy_error.append_value(record.energy_error);
        self.step_size.append_value(record.step_size);
        self.step_size_bar.append_value(record.step_size_bar);
        self.depth.append_value(record.depth);
        self.n_steps.append_value(record.n_steps);
        self.maxdepth_reached.append_value(record.maxdepth_reached);
        self.diverging.append_value(record.diverging);
        self.accept_stat.append_value(record.accept_stat);
        self.index_in_trajectory.append_value(record.index_in_trajectory);
        Ok(())
    }
}
