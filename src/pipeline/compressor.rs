// In: src/pipeline/compressor.rs

//! The compression pipeline: model attributes in, container (plus codebook side
//! artifact) out, and back.
//!
//! The compressor owns the configuration, the codec and the quantizer. The
//! quantizer's codebook persists across calls, which is what the `Reuse` and
//! `FitIfMissing` policies build on; `&mut self` on every run keeps that state
//! from being shared between concurrent runs.

use std::path::Path;

use arrow::record_batch::RecordBatch;

use crate::codec::{EncodeOptions, RecordCodec};
use crate::config::{Backend, CodebookPolicy, GsvqConfig};
use crate::error::GsvqError;
use crate::layout::RecordLayout;
use crate::model::SplatModel;
use crate::pipeline::container::ContainerHeader;
use crate::pipeline::stage::{PipelineStage, StageTracker};
use crate::quantization::{dequantize_into, Codebook, VectorQuantizer};
use crate::store;
use crate::types::{AttributeKey, AttributeSet};

/// Attributes every compressed model must carry.
const REQUIRED_ATTRIBUTES: [AttributeKey; 5] = [
    AttributeKey::Position,
    AttributeKey::Scale,
    AttributeKey::Rotation,
    AttributeKey::Opacity,
    AttributeKey::FeatureDc,
];

//==================================================================================
// 1. Results
//==================================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionSummary {
    pub backend: Backend,
    pub num_points: usize,
    pub band_degree: usize,
    pub container_bytes: usize,
    /// Size of the codebook side artifact; `None` for the raw backend and for
    /// in-memory runs.
    pub codebook_bytes: Option<usize>,
    /// Whether this run fit a new codebook rather than reusing the held one.
    pub codebook_refit: bool,
}

/// The output of an in-memory compression.
#[derive(Debug, Clone)]
pub struct CompressedSplats {
    pub container: Vec<u8>,
    /// The codebook the container's ids index into; `None` for the raw backend.
    pub codebook: Option<Codebook>,
    pub summary: CompressionSummary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecompressionSummary {
    pub backend: Backend,
    pub num_points: usize,
    pub band_degree: usize,
}

/// Where a decompression reads its inputs from.
enum Source<'a> {
    File(&'a Path),
    Memory {
        container: &'a [u8],
        codebook: Option<Codebook>,
    },
}

//==================================================================================
// 2. The Compressor
//==================================================================================

pub struct SplatCompressor<C: RecordCodec> {
    config: GsvqConfig,
    codec: C,
    quantizer: VectorQuantizer,
    last_stages: Vec<PipelineStage>,
}

impl<C: RecordCodec> SplatCompressor<C> {
    pub fn new(config: GsvqConfig, codec: C) -> Result<Self, GsvqError> {
        config.validate_static()?;
        let quantizer = VectorQuantizer::new(config.clusters.clone());
        Ok(Self {
            config,
            codec,
            quantizer,
            last_stages: Vec::new(),
        })
    }

    pub fn config(&self) -> &GsvqConfig {
        &self.config
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn quantizer(&self) -> &VectorQuantizer {
        &self.quantizer
    }

    /// Seeds the quantizer with an existing codebook, e.g. one shared between scenes.
    pub fn set_codebook(&mut self, codebook: Codebook) {
        self.quantizer.set_codebook(codebook);
    }

    /// The stages the most recent run went through, `Failed` included.
    pub fn last_stages(&self) -> &[PipelineStage] {
        &self.last_stages
    }

    //==============================================================================
    // Compress
    //==============================================================================

    /// Compresses `model` into the container at `path`.
    ///
    /// The container is written first, then (quantized backend only) the
    /// codebook next to it; both are atomic replacements.
    pub fn compress<M: SplatModel + ?Sized>(
        &mut self,
        model: &M,
        path: &Path,
    ) -> Result<CompressionSummary, GsvqError> {
        let mut tracker = StageTracker::new("compress");
        let result = self.compress_stages(model, &mut tracker).and_then(|compressed| {
            tracker.run(PipelineStage::Persisted, || {
                store::write_atomic(path, &compressed.container)?;
                let codebook_bytes = compressed
                    .codebook
                    .as_ref()
                    .map(|codebook| store::save(codebook, &store::codebook_path(path)))
                    .transpose()?;
                Ok(CompressionSummary {
                    codebook_bytes,
                    ..compressed.summary
                })
            })
        });
        self.last_stages = tracker.into_history();

        if let Ok(summary) = &result {
            log::info!(
                "Compressed {} points ({} backend) into {} ({} bytes, codebook {:?} bytes)",
                summary.num_points,
                summary.backend.name(),
                path.display(),
                summary.container_bytes,
                summary.codebook_bytes
            );
        }
        result
    }

    /// The in-memory variant of `compress`: nothing touches the filesystem.
    pub fn compress_to_bytes<M: SplatModel + ?Sized>(
        &mut self,
        model: &M,
    ) -> Result<CompressedSplats, GsvqError> {
        let mut tracker = StageTracker::new("compress");
        let result = self.compress_stages(model, &mut tracker).and_then(|compressed| {
            tracker.run(PipelineStage::Persisted, || Ok(compressed))
        });
        self.last_stages = tracker.into_history();
        result
    }

    fn compress_stages<M: SplatModel + ?Sized>(
        &mut self,
        model: &M,
        tracker: &mut StageTracker,
    ) -> Result<CompressedSplats, GsvqError> {
        match self.config.backend {
            Backend::Quantized => self.compress_quantized(model, tracker),
            Backend::Raw => self.compress_raw(model, tracker),
        }
    }

    fn compress_quantized<M: SplatModel + ?Sized>(
        &mut self,
        model: &M,
        tracker: &mut StageTracker,
    ) -> Result<CompressedSplats, GsvqError> {
        let quantizer = &mut self.quantizer;
        let policy = self.config.codebook_policy;

        let (attrs, ids, codebook, refit) = tracker.run(PipelineStage::Quantizing, || {
            let attrs = model_attributes(model)?;
            let refit = match policy {
                CodebookPolicy::Reuse => false,
                CodebookPolicy::Refit => true,
                CodebookPolicy::FitIfMissing => !quantizer.is_fitted(),
            };
            let (ids, codebook) = quantizer.quantize(&attrs, refit)?;
            Ok((attrs, ids, codebook, refit))
        })?;

        let batch = tracker.run(PipelineStage::LayoutBuilding, || {
            let layout = RecordLayout::quantized(&codebook.cluster_counts())?;
            layout.pack_quantized(attrs.require(AttributeKey::Position)?, &ids)
        })?;

        let container = tracker.run(PipelineStage::Encoding, || {
            self.encode_container(Backend::Quantized, &batch)
        })?;

        crate::log_metric!(
            "event" = "compress",
            "backend" = "quantized",
            "points" = batch.num_rows(),
            "channels" = codebook.len(),
            "refit" = refit,
            "container_bytes" = container.len()
        );

        let summary = CompressionSummary {
            backend: Backend::Quantized,
            num_points: batch.num_rows(),
            band_degree: attrs.band_degree(),
            container_bytes: container.len(),
            codebook_bytes: None,
            codebook_refit: refit,
        };
        Ok(CompressedSplats {
            container,
            codebook: Some(codebook),
            summary,
        })
    }

    fn compress_raw<M: SplatModel + ?Sized>(
        &mut self,
        model: &M,
        tracker: &mut StageTracker,
    ) -> Result<CompressedSplats, GsvqError> {
        let (attrs, batch) = tracker.run(PipelineStage::LayoutBuilding, || {
            let attrs = model_attributes(model)?;
            let layout = RecordLayout::raw(&attrs.dims())?;
            let batch = layout.pack_raw(&attrs)?;
            Ok((attrs, batch))
        })?;

        let container = tracker.run(PipelineStage::Encoding, || {
            self.encode_container(Backend::Raw, &batch)
        })?;

        crate::log_metric!(
            "event" = "compress",
            "backend" = "raw",
            "points" = batch.num_rows(),
            "fields" = batch.num_columns(),
            "container_bytes" = container.len()
        );

        let summary = CompressionSummary {
            backend: Backend::Raw,
            num_points: batch.num_rows(),
            band_degree: attrs.band_degree(),
            container_bytes: container.len(),
            codebook_bytes: None,
            codebook_refit: false,
        };
        Ok(CompressedSplats {
            container,
            codebook: None,
            summary,
        })
    }

    fn encode_container(&self, backend: Backend, batch: &RecordBatch) -> Result<Vec<u8>, GsvqError> {
        let options = EncodeOptions::from_config(&self.config);
        log::debug!(
            "Encoding {} records with codec '{}' (level {})",
            batch.num_rows(),
            self.codec.name(),
            options.compression_level
        );
        let payload = self.codec.encode(batch, &options)?;
        Ok(ContainerHeader::new(backend, batch.num_rows() as u64).wrap(&payload))
    }

    //==============================================================================
    // Decompress
    //==============================================================================

    /// Decompresses the container at `path` into `model`, replacing its
    /// attributes. The quantized backend also reads the codebook next to the
    /// container and keeps it in the quantizer.
    pub fn decompress<M: SplatModel + ?Sized>(
        &mut self,
        model: &mut M,
        path: &Path,
    ) -> Result<DecompressionSummary, GsvqError> {
        let result = self.decompress_from(model, Source::File(path));
        if let Ok(summary) = &result {
            log::info!(
                "Decompressed {} points ({} backend) from {}",
                summary.num_points,
                summary.backend.name(),
                path.display()
            );
        }
        result
    }

    /// The in-memory variant of `decompress`. For the quantized backend,
    /// `codebook` falls back to the quantizer's own when `None`.
    pub fn decompress_from_bytes<M: SplatModel + ?Sized>(
        &mut self,
        model: &mut M,
        container: &[u8],
        codebook: Option<Codebook>,
    ) -> Result<DecompressionSummary, GsvqError> {
        self.decompress_from(model, Source::Memory { container, codebook })
    }

    fn decompress_from<M: SplatModel + ?Sized>(
        &mut self,
        model: &mut M,
        source: Source<'_>,
    ) -> Result<DecompressionSummary, GsvqError> {
        let mut tracker = StageTracker::new("decompress");
        let result = match self.config.backend {
            Backend::Quantized => self.decompress_quantized(model, source, &mut tracker),
            Backend::Raw => self.decompress_raw(model, source, &mut tracker),
        };
        self.last_stages = tracker.into_history();
        result
    }

    fn decompress_quantized<M: SplatModel + ?Sized>(
        &mut self,
        model: &mut M,
        source: Source<'_>,
        tracker: &mut StageTracker,
    ) -> Result<DecompressionSummary, GsvqError> {
        let (batch, codebook) = tracker.run(PipelineStage::Decoding, || {
            let (batch, supplied) = self.decode_source(Backend::Quantized, source)?;
            let codebook = match supplied {
                Some(codebook) => codebook,
                None => self
                    .quantizer
                    .codebook()
                    .cloned()
                    .ok_or(GsvqError::NotFitted)?,
            };
            Ok((batch, codebook))
        })?;

        let degree = model.max_band_degree();
        let (positions, ids, used) = tracker.run(PipelineStage::Parsing, || {
            // A codebook may cover more bands than the model; those are not in the records.
            let used = codebook.for_degree(degree)?;
            let layout = RecordLayout::quantized(&used.cluster_counts())?;
            let (positions, ids) = layout.parse_quantized(&batch)?;
            Ok((positions, ids, used))
        })?;

        let num_points = positions.nrows();
        tracker.run(PipelineStage::Dequantizing, || {
            dequantize_into(model, &ids, &used, positions)
        })?;

        tracker.run(PipelineStage::Applied, || {
            self.quantizer.set_codebook(codebook);
            Ok(DecompressionSummary {
                backend: Backend::Quantized,
                num_points,
                band_degree: degree,
            })
        })
    }

    fn decompress_raw<M: SplatModel + ?Sized>(
        &mut self,
        model: &mut M,
        source: Source<'_>,
        tracker: &mut StageTracker,
    ) -> Result<DecompressionSummary, GsvqError> {
        let batch = tracker.run(PipelineStage::Decoding, || {
            self.decode_source(Backend::Raw, source).map(|(batch, _)| batch)
        })?;

        let attrs = tracker.run(PipelineStage::Parsing, || {
            let layout = RecordLayout::raw_from_schema(&batch.schema())?;
            let attrs = layout.parse_raw(&batch)?;
            require_attributes(&attrs)?;
            Ok(attrs)
        })?;

        let num_points = batch.num_rows();
        let band_degree = attrs.band_degree();
        tracker.run(PipelineStage::Applied, || model.set_attributes(attrs))?;
        Ok(DecompressionSummary {
            backend: Backend::Raw,
            num_points,
            band_degree,
        })
    }

    /// Reads the container (and, for file sources of the quantized backend, the
    /// codebook next to it), checks the envelope and runs the codec decoder.
    fn decode_source(
        &self,
        expected: Backend,
        source: Source<'_>,
    ) -> Result<(RecordBatch, Option<Codebook>), GsvqError> {
        let (bytes, path, supplied) = match source {
            Source::File(path) => (std::fs::read(path)?, Some(path), None),
            Source::Memory { container, codebook } => (container.to_vec(), None, codebook),
        };

        let (header, payload) = ContainerHeader::parse(&bytes)?;
        header.expect_backend(expected)?;

        let codebook = match (expected, path) {
            (Backend::Quantized, Some(path)) => Some(store::load(&store::codebook_path(path))?),
            _ => supplied,
        };

        let batch = self.codec.decode(payload)?;
        if batch.num_rows() as u64 != header.num_points {
            return Err(GsvqError::Layout(format!(
                "Container declares {} points but the codec returned {} records",
                header.num_points,
                batch.num_rows()
            )));
        }
        Ok((batch, codebook))
    }
}

//==================================================================================
// 3. Helpers
//==================================================================================

/// A validated snapshot of the model's attributes.
fn model_attributes<M: SplatModel + ?Sized>(model: &M) -> Result<AttributeSet, GsvqError> {
    let attrs = model.attributes();
    attrs.validate()?;
    require_attributes(&attrs)?;
    if attrs.band_degree() != model.max_band_degree() {
        return Err(GsvqError::UnsupportedDegree {
            requested: attrs.band_degree(),
            supported: model.max_band_degree(),
        });
    }
    Ok(attrs)
}

fn require_attributes(attrs: &AttributeSet) -> Result<(), GsvqError> {
    for key in REQUIRED_ATTRIBUTES {
        attrs.require(key)?;
    }
    Ok(())
}
