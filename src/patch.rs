//! Patch artifact: both containers, then one section per source file.
//!
//! ```text
//! MAGIC  HEADER  target Container  source Container
//!   SyncHeader{0, Rsync}        SyncOp* HeyYouDidIt
//!   SyncHeader{1, Bsdiff{t}}    BsdiffControl* (eof) HeyYouDidIt
//!   ...
//! ```
//!
//! Sections appear in source container order, one per file, empty files
//! included.

use std::io::{Read, Write};

use crate::bsdiff::BsdiffControl;
use crate::compression::CompressionSettings;
use crate::container::Container;
use crate::error::{Result, SuturaError};
use crate::ops::{SyncHeader, SyncOp};
use crate::wire::{WireReader, WireWriter, PATCH_MAGIC};

/// Writes a patch artifact section by section.
pub struct PatchWriter<W: Write> {
    wire: WireWriter<W>,
    files: usize,
    next_file: usize,
    in_file: bool,
}

impl<W: Write> PatchWriter<W> {
    /// Start a patch from `target` (old) to `source` (new).
    ///
    /// # Errors
    ///
    /// Returns an error if the preamble cannot be written.
    pub fn new(
        inner: W,
        compression: CompressionSettings,
        target: &Container,
        source: &Container,
    ) -> Result<Self> {
        let mut wire = WireWriter::new(inner, PATCH_MAGIC, compression)?;
        wire.write_message(target)?;
        wire.write_message(source)?;
        Ok(Self {
            wire,
            files: source.files.len(),
            next_file: 0,
            in_file: false,
        })
    }

    /// Open the section of the next source file.
    ///
    /// # Errors
    ///
    /// Returns a `Usage` error if sections are written out of order.
    pub fn begin_file(&mut self, header: &SyncHeader) -> Result<()> {
        if self.in_file || header.file_index != self.next_file as u64 {
            return Err(SuturaError::Usage(format!(
                "patch section for file {} written out of order (expected {})",
                header.file_index, self.next_file
            )));
        }
        self.in_file = true;
        self.wire.write_message(header)
    }

    /// Append an op to the current section.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub fn write_op(&mut self, op: &SyncOp) -> Result<()> {
        self.wire.write_message(op)
    }

    /// Append a bsdiff control to the current section.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub fn write_control(&mut self, control: &BsdiffControl) -> Result<()> {
        self.wire.write_message(control)
    }

    /// Close the current section.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    pub fn end_file(&mut self) -> Result<()> {
        self.wire.write_message(&SyncOp::HeyYouDidIt)?;
        self.in_file = false;
        self.next_file += 1;
        Ok(())
    }

    /// Finish the artifact.
    ///
    /// # Errors
    ///
    /// Returns a `Usage` error if some source file has no section.
    pub fn finish(self) -> Result<W> {
        if self.in_file || self.next_file != self.files {
            return Err(SuturaError::Usage(format!(
                "patch finished after {} of {} files",
                self.next_file, self.files
            )));
        }
        self.wire.finish()
    }
}

/// Reads a patch artifact section by section.
pub struct PatchReader<R: Read> {
    wire: WireReader<R>,
    /// Container the patch applies to.
    pub target: Container,
    /// Container the patch produces.
    pub source: Container,
    next_file: usize,
}

impl<R: Read> PatchReader<R> {
    /// Open a patch and read both containers.
    ///
    /// # Errors
    ///
    /// Returns `UnrecognizedFormat` if this is not a patch, or a format error
    /// if the containers cannot be decoded.
    pub fn open(inner: R) -> Result<Self> {
        let mut wire = WireReader::open(inner, PATCH_MAGIC)?;
        let target = wire.read_message("target container")?;
        let source = wire.read_message("source container")?;
        Ok(Self {
            wire,
            target,
            source,
            next_file: 0,
        })
    }

    /// Compression the patch was written with.
    #[must_use]
    pub const fn compression(&self) -> CompressionSettings {
        self.wire.compression()
    }

    /// Header of the next section, or `None` once every source file was read.
    ///
    /// # Errors
    ///
    /// Returns `Truncated` if the patch ends early and `Malformed` if the
    /// section is not for the expected file.
    pub fn next_file(&mut self) -> Result<Option<SyncHeader>> {
        if self.next_file == self.source.files.len() {
            return Ok(None);
        }
        let header: SyncHeader = self.wire.read_message("sync header")?;
        if header.file_index != self.next_file as u64 {
            return Err(SuturaError::Malformed(format!(
                "expected section for file {}, found {}",
                self.next_file, header.file_index
            )));
        }
        self.next_file += 1;
        Ok(Some(header))
    }

    /// Next op of an rsync section.
    ///
    /// # Errors
    ///
    /// Returns `Truncated` if the patch ends mid-section.
    pub fn next_op(&mut self) -> Result<SyncOp> {
        self.wire.read_message("sync op")
    }

    /// Next control of a bsdiff section. After the eof control, the section
    /// must be closed with [`end_bsdiff`](Self::end_bsdiff).
    ///
    /// # Errors
    ///
    /// Returns `Truncated` if the patch ends mid-section.
    pub fn next_control(&mut self) -> Result<BsdiffControl> {
        self.wire.read_message("bsdiff control")
    }

    /// Read the terminator of a bsdiff section.
    ///
    /// # Errors
    ///
    /// Returns `Malformed` if anything but the terminator follows.
    pub fn end_bsdiff(&mut self) -> Result<()> {
        match self.next_op()? {
            SyncOp::HeyYouDidIt => Ok(()),
            other => Err(SuturaError::Malformed(format!(
                "expected end of bsdiff section, found {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::File;
    use crate::ops::SyncKind;

    fn containers() -> (Container, Container) {
        let mut target = Container::default();
        target.files.push(File {
            path: "a".to_string(),
            mode: 0o644,
            size: 3,
            offset: 0,
        });
        target.size = 3;
        let mut source = target.clone();
        source.files.push(File {
            path: "b".to_string(),
            mode: 0o755,
            size: 2,
            offset: 3,
        });
        source.size = 5;
        (target, source)
    }

    fn sample_patch() -> Vec<u8> {
        let (target, source) = containers();
        let mut writer =
            PatchWriter::new(Vec::new(), CompressionSettings::default(), &target, &source)
                .unwrap();
        writer
            .begin_file(&SyncHeader {
                file_index: 0,
                kind: SyncKind::Rsync,
            })
            .unwrap();
        writer.write_op(&SyncOp::block_range(0, 0, 1)).unwrap();
        writer.end_file().unwrap();
        writer
            .begin_file(&SyncHeader {
                file_index: 1,
                kind: SyncKind::Bsdiff { target_index: 0 },
            })
            .unwrap();
        writer
            .write_control(&BsdiffControl {
                extra: b"hi".to_vec(),
                ..BsdiffControl::default()
            })
            .unwrap();
        writer.write_control(&BsdiffControl::eof()).unwrap();
        writer.end_file().unwrap();
        writer.finish().unwrap()
    }

    #[test]
    fn sections_roundtrip() {
        let bytes = sample_patch();
        let mut reader = PatchReader::open(bytes.as_slice()).unwrap();
        let (target, source) = containers();
        assert_eq!(reader.target, target);
        assert_eq!(reader.source, source);

        let header = reader.next_file().unwrap().unwrap();
        assert_eq!(header.kind, SyncKind::Rsync);
        assert_eq!(reader.next_op().unwrap(), SyncOp::block_range(0, 0, 1));
        assert_eq!(reader.next_op().unwrap(), SyncOp::HeyYouDidIt);

        let header = reader.next_file().unwrap().unwrap();
        assert_eq!(header.kind, SyncKind::Bsdiff { target_index: 0 });
        assert_eq!(reader.next_control().unwrap().extra, b"hi");
        assert!(reader.next_control().unwrap().eof);
        reader.end_bsdiff().unwrap();

        assert!(reader.next_file().unwrap().is_none());
    }

    #[test]
    fn truncated_patch_is_detected() {
        let (target, source) = containers();
        let mut writer =
            PatchWriter::new(Vec::new(), CompressionSettings::none(), &target, &source).unwrap();
        writer
            .begin_file(&SyncHeader {
                file_index: 0,
                kind: SyncKind::Rsync,
            })
            .unwrap();
        writer.end_file().unwrap();
        // Finishing early is refused, so build the cut artifact by hand.
        assert!(matches!(writer.finish(), Err(SuturaError::Usage(_))));

        let mut wire = WireWriter::new(Vec::new(), PATCH_MAGIC, CompressionSettings::none()).unwrap();
        wire.write_message(&target).unwrap();
        wire.write_message(&source).unwrap();
        let cut = wire.finish().unwrap();
        let mut reader = PatchReader::open(cut.as_slice()).unwrap();
        assert!(matches!(reader.next_file(), Err(SuturaError::Truncated(_))));
    }

    #[test]
    fn out_of_order_sections() {
        let (target, source) = containers();
        let mut writer =
            PatchWriter::new(Vec::new(), CompressionSettings::none(), &target, &source).unwrap();
        let err = writer
            .begin_file(&SyncHeader {
                file_index: 1,
                kind: SyncKind::Rsync,
            })
            .unwrap_err();
        assert!(matches!(err, SuturaError::Usage(_)));

        let mut wire = WireWriter::new(Vec::new(), PATCH_MAGIC, CompressionSettings::none()).unwrap();
        wire.write_message(&target).unwrap();
        wire.write_message(&source).unwrap();
        wire.write_message(&SyncHeader {
            file_index: 1,
            kind: SyncKind::Rsync,
        })
        .unwrap();
        let bytes = wire.finish().unwrap();
        let mut reader = PatchReader::open(bytes.as_slice()).unwrap();
        assert!(matches!(reader.next_file(), Err(SuturaError::Malformed(_))));
    }

    #[test]
    fn signature_is_not_a_patch() {
        let bytes = WireWriter::new(
            Vec::new(),
            crate::wire::SIGNATURE_MAGIC,
            CompressionSettings::none(),
        )
        .unwrap()
        .finish()
        .unwrap();
        assert!(matches!(
            PatchReader::open(bytes.as_slice()),
            Err(SuturaError::UnrecognizedFormat { .. })
        ));
    }
}
