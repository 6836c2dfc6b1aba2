//! A codec backed by external encoder/decoder executables that speak PLY.
//!
//! The executables are always given explicitly; nothing is discovered from the
//! working directory or the platform.

use std::ffi::OsString;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;

use arrow::record_batch::RecordBatch;

use super::{ply, EncodeOptions, RecordCodec};
use crate::error::GsvqError;

const RECORDS_PLY: &str = "records.ply";
const RECORDS_ENCODED: &str = "records.drc";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalProcessCodec {
    encoder: PathBuf,
    decoder: PathBuf,
}

impl ExternalProcessCodec {
    pub fn new(encoder: impl Into<PathBuf>, decoder: impl Into<PathBuf>) -> Self {
        Self {
            encoder: encoder.into(),
            decoder: decoder.into(),
        }
    }

    pub fn encoder(&self) -> &Path {
        &self.encoder
    }

    pub fn decoder(&self) -> &Path {
        &self.decoder
    }

    /// The encoder command line: input, output, level, then one bit depth per group.
    pub fn encoder_args(input: &Path, output: &Path, options: &EncodeOptions) -> Vec<OsString> {
        let bits = &options.bits;
        let mut args: Vec<OsString> = vec![
            "-i".into(),
            input.into(),
            "-o".into(),
            output.into(),
        ];
        let numeric = [
            ("-cl", options.compression_level),
            ("-qp", bits.position),
            ("-qscale", bits.scale),
            ("-qrotation", bits.rotation),
            ("-qopacity", bits.opacity),
            ("-qfeaturedc", bits.feature_dc),
            ("-qfeaturerest", bits.feature_rest),
        ];
        for (flag, value) in numeric {
            args.push(flag.into());
            args.push(value.to_string().into());
        }
        args
    }
}

impl RecordCodec for ExternalProcessCodec {
    fn name(&self) -> &str {
        "external-process"
    }

    fn encode(&self, batch: &RecordBatch, options: &EncodeOptions) -> Result<Vec<u8>, GsvqError> {
        let workspace = tempfile::tempdir()?;
        let input = workspace.path().join(RECORDS_PLY);
        let output = workspace.path().join(RECORDS_ENCODED);

        let mut writer = BufWriter::new(File::create(&input)?);
        ply::write_binary_le(batch, &mut writer)?;
        writer.flush()?;
        drop(writer);

        let mut command = Command::new(&self.encoder);
        command.args(Self::encoder_args(&input, &output, options));
        run(command, &self.encoder)?;

        read_output(&output, &self.encoder)
    }

    fn decode(&self, bytes: &[u8]) -> Result<RecordBatch, GsvqError> {
        let workspace = tempfile::tempdir()?;
        let input = workspace.path().join(RECORDS_ENCODED);
        let output = workspace.path().join(RECORDS_PLY);
        std::fs::write(&input, bytes)?;

        let mut command = Command::new(&self.decoder);
        command.arg("-i").arg(&input).arg("-o").arg(&output);
        run(command, &self.decoder)?;

        ply::read(&read_output(&output, &self.decoder)?)
    }
}

fn run(mut command: Command, tool: &Path) -> Result<(), GsvqError> {
    log::debug!("Running codec tool: {:?}", command);
    let output = command.output().map_err(|e| {
        GsvqError::CodecBoundary(format!("Failed to launch '{}': {}", tool.display(), e))
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(GsvqError::CodecBoundary(format!(
            "'{}' exited with {}: {}",
            tool.display(),
            output.status,
            stderr.trim()
        )));
    }
    Ok(())
}

fn read_output(path: &Path, tool: &Path) -> Result<Vec<u8>, GsvqError> {
    std::fs::read(path).map_err(|e| {
        GsvqError::CodecBoundary(format!(
            "'{}' reported success but its output {} is unreadable: {}",
            tool.display(),
            path.display(),
            e
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuantizationBits;

    #[test]
    fn test_encoder_args_forward_every_knob() {
        let options = EncodeOptions {
            compression_level: 7,
            bits: QuantizationBits {
                rotation: 12,
                ..QuantizationBits::uniform(16)
            },
        };
        let args = ExternalProcessCodec::encoder_args(Path::new("in.ply"), Path::new("out.drc"), &options);
        let args: Vec<String> = args
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "-i", "in.ply", "-o", "out.drc", "-cl", "7", "-qp", "16", "-qscale", "16",
                "-qrotation", "12", "-qopacity", "16", "-qfeaturedc", "16", "-qfeaturerest", "16"
            ]
        );
    }

    /// All process-spawning scenarios live in one test so no other test forks
    /// while a freshly written script is being executed.
    #[cfg(unix)]
    #[test]
    fn test_process_codec_roundtrip_and_failures() {
        use std::os::unix::fs::PermissionsExt;
        use std::sync::Arc;

        use arrow::array::{Float32Array, UInt8Array};
        use arrow::datatypes::{DataType, Field, Schema};

        let dir = tempfile::tempdir().unwrap();
        let script = |name: &str, body: &str| {
            let path = dir.path().join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        };

        // Copies its -i argument to its -o argument.
        let copy = script(
            "copy.sh",
            r#"while [ $# -gt 0 ]; do
  case "$1" in
    -i) src="$2"; shift 2 ;;
    -o) dst="$2"; shift 2 ;;
    *) shift ;;
  esac
done
cp "$src" "$dst""#,
        );
        let failing = script("fail.sh", "echo 'unsupported attribute layout' >&2\nexit 3");
        let silent = script("silent.sh", "exit 0");

        let schema = Arc::new(Schema::new(vec![
            Field::new("x", DataType::Float32, false),
            Field::new("opacity", DataType::UInt8, false),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Float32Array::from(vec![0.5f32, 1.5])),
                Arc::new(UInt8Array::from(vec![3u8, 200])),
            ],
        )
        .unwrap();

        let codec = ExternalProcessCodec::new(&copy, &copy);
        let bytes = codec.encode(&batch, &EncodeOptions::default()).unwrap();
        assert!(bytes.starts_with(b"ply\n"));
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded.columns(), batch.columns());

        let codec = ExternalProcessCodec::new(&failing, &failing);
        match codec.encode(&batch, &EncodeOptions::default()) {
            Err(GsvqError::CodecBoundary(message)) => {
                assert!(message.contains("unsupported attribute layout"), "{}", message)
            }
            other => panic!("expected CodecBoundary, got {:?}", other),
        }

        let codec = ExternalProcessCodec::new(&silent, &silent);
        assert!(matches!(
            codec.decode(b"anything"),
            Err(GsvqError::CodecBoundary(_))
        ));

        let codec = ExternalProcessCodec::new(dir.path().join("missing"), &copy);
        assert!(matches!(
            codec.encode(&batch, &EncodeOptions::default()),
            Err(GsvqError::CodecBoundary(_))
        ));
    }
}
