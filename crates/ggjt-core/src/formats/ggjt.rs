//! Reader and writer for the GGML / GGMF / GGJT model file family.
//!
//! Little-endian throughout. Layout: magic (+ version for GGMF/GGJT), seven
//! u32 hyper-parameters, the scored vocabulary, then tensor metadata blocks
//! with payloads aligned to 32 bytes.

use crate::error::{Error, Result};
use crate::tensor::{tensor_size, TensorDesc, TensorType};
use crate::vocab::Vocabulary;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Seek, SeekFrom, Write};

pub const MAGIC_GGML: u32 = 0x6767_6d6c; // 'ggml', legacy, unversioned
pub const MAGIC_GGMF: u32 = 0x6767_6d66; // 'ggmf'
pub const MAGIC_GGJT: u32 = 0x6767_6a74; // 'ggjt'

/// Version word written by [`GgjtWriter`].
pub const FILE_VERSION: u32 = 3;

/// Tensor payload alignment in bytes.
pub const TENSOR_ALIGN: u64 = 32;

/// Recognized (magic, version) combinations, oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FileVersion {
    /// Unversioned 'ggml': no vocab scores, no alignment padding.
    Ggml,
    /// 'ggmf' v1: added the version word and vocab scores.
    GgmfV1,
    /// 'ggjt' v1: added payload alignment.
    GgjtV1,
    /// 'ggjt' v2: changed the quantization format.
    GgjtV2,
    /// 'ggjt' v3: changed the Q4/Q8 quantization format.
    GgjtV3,
}

impl FileVersion {
    pub fn name(&self) -> &'static str {
        match self {
            FileVersion::Ggml => "'ggml' (old version with low tokenizer quality and no mmap support)",
            FileVersion::GgmfV1 => "ggmf v1 (old version with no mmap support)",
            FileVersion::GgjtV1 => "ggjt v1 (pre #1405)",
            FileVersion::GgjtV2 => "ggjt v2 (pre #1508)",
            FileVersion::GgjtV3 => "ggjt v3 (latest)",
        }
    }
}

/// File-level quantization scheme. The discriminants are the on-disk words.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FType {
    AllF32 = 0,
    MostlyF16 = 1,
    MostlyQ4_0 = 2,
    MostlyQ4_1 = 3,
    MostlyQ4_1SomeF16 = 4,
    MostlyQ8_0 = 7,
    MostlyQ5_0 = 8,
    MostlyQ5_1 = 9,
    MostlyQ2K = 10,
    MostlyQ3KS = 11,
    MostlyQ3KM = 12,
    MostlyQ3KL = 13,
    MostlyQ4KS = 14,
    MostlyQ4KM = 15,
    MostlyQ5KS = 16,
    MostlyQ5KM = 17,
    MostlyQ6K = 18,
}

impl FType {
    pub fn from_u32(v: u32) -> Result<Self> {
        use FType::*;
        Ok(match v {
            0 => AllF32,
            1 => MostlyF16,
            2 => MostlyQ4_0,
            3 => MostlyQ4_1,
            4 => MostlyQ4_1SomeF16,
            7 => MostlyQ8_0,
            8 => MostlyQ5_0,
            9 => MostlyQ5_1,
            10 => MostlyQ2K,
            11 => MostlyQ3KS,
            12 => MostlyQ3KM,
            13 => MostlyQ3KL,
            14 => MostlyQ4KS,
            15 => MostlyQ4KM,
            16 => MostlyQ5KS,
            17 => MostlyQ5KM,
            18 => MostlyQ6K,
            other => return Err(Error::UnsupportedFType(other)),
        })
    }

    pub fn name(&self) -> &'static str {
        use FType::*;
        match self {
            AllF32 => "all F32",
            MostlyF16 => "mostly F16",
            MostlyQ4_0 => "mostly Q4_0",
            MostlyQ4_1 => "mostly Q4_1",
            MostlyQ4_1SomeF16 => "mostly Q4_1, some F16",
            MostlyQ8_0 => "mostly Q8_0",
            MostlyQ5_0 => "mostly Q5_0",
            MostlyQ5_1 => "mostly Q5_1",
            MostlyQ2K => "mostly Q2_K",
            MostlyQ3KS => "mostly Q3_K - Small",
            MostlyQ3KM => "mostly Q3_K - Medium",
            MostlyQ3KL => "mostly Q3_K - Large",
            MostlyQ4KS => "mostly Q4_K - Small",
            MostlyQ4KM => "mostly Q4_K - Medium",
            MostlyQ5KS => "mostly Q5_K - Small",
            MostlyQ5KM => "mostly Q5_K - Medium",
            MostlyQ6K => "mostly Q6_K",
        }
    }

    /// Default tensor type for weights quantized under this scheme.
    pub fn quantized_type(&self) -> Result<TensorType> {
        use FType::*;
        Ok(match self {
            AllF32 => TensorType::F32,
            MostlyF16 => TensorType::F16,
            MostlyQ4_0 => TensorType::Q4_0,
            MostlyQ4_1 => TensorType::Q4_1,
            MostlyQ5_0 => TensorType::Q5_0,
            MostlyQ5_1 => TensorType::Q5_1,
            MostlyQ8_0 => TensorType::Q8_0,
            MostlyQ2K => TensorType::Q2_K,
            MostlyQ3KS | MostlyQ3KM | MostlyQ3KL => TensorType::Q3_K,
            MostlyQ4KS | MostlyQ4KM => TensorType::Q4_K,
            MostlyQ5KS | MostlyQ5KM => TensorType::Q5_K,
            MostlyQ6K => TensorType::Q6_K,
            MostlyQ4_1SomeF16 => return Err(Error::UnsupportedFType(*self as u32)),
        })
    }
}

/// Model hyper-parameters. `n_ctx` and the rope parameters are not stored in
/// the file; the loader injects them. Immutable once a context exists.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HParams {
    pub n_vocab: u32,
    pub n_ctx: u32,
    pub n_embd: u32,
    pub n_mult: u32,
    pub n_head: u32,
    pub n_layer: u32,
    pub n_rot: u32,
    pub rope_freq_base: f32,
    pub rope_freq_scale: f32,
    pub ftype: FType,
}

impl Default for HParams {
    fn default() -> Self {
        Self {
            n_vocab: 32000,
            n_ctx: 512,
            n_embd: 4096,
            n_mult: 256,
            n_head: 32,
            n_layer: 32,
            n_rot: 64,
            rope_freq_base: 10000.0,
            rope_freq_scale: 1.0,
            ftype: FType::MostlyF16,
        }
    }
}

impl HParams {
    /// Feed-forward width derived from `n_embd`, rounded up to `n_mult`.
    pub fn n_ff(&self) -> u32 {
        ((2 * (4 * self.n_embd) / 3 + self.n_mult - 1) / self.n_mult) * self.n_mult
    }
}

/// Everything read from a model file short of the tensor payloads.
#[derive(Debug)]
pub struct ModelFile {
    pub version: FileVersion,
    pub hparams: HParams,
    pub vocab: Vocabulary,
    /// Tensor descriptors in file order.
    pub tensors: Vec<TensorDesc>,
}

/// Streaming reader for GGML/GGMF/GGJT files.
pub struct GgjtParser<R: Read + Seek> {
    reader: R,
}

impl<R: Read + Seek> GgjtParser<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Parse magic, hyper-parameters, vocabulary and tensor metadata.
    pub fn parse(&mut self) -> Result<ModelFile> {
        let version = self.read_magic()?;
        let hparams = self.read_hparams()?;
        let vocab = self.read_vocab(&hparams, version)?;
        let tensors = self.read_tensor_metadata(version)?;
        log::debug!(
            "model file: {} tensors, format {}",
            tensors.len(),
            version.name()
        );
        Ok(ModelFile { version, hparams, vocab, tensors })
    }

    fn read_magic(&mut self) -> Result<FileVersion> {
        let magic = self.reader.read_u32::<LittleEndian>()?;
        if magic == MAGIC_GGML {
            return Ok(FileVersion::Ggml);
        }
        let version = self.reader.read_u32::<LittleEndian>()?;
        match (magic, version) {
            (MAGIC_GGMF, 1) => Ok(FileVersion::GgmfV1),
            (MAGIC_GGJT, 1) => Ok(FileVersion::GgjtV1),
            (MAGIC_GGJT, 2) => Ok(FileVersion::GgjtV2),
            (MAGIC_GGJT, 3) => Ok(FileVersion::GgjtV3),
            (MAGIC_GGMF, v) | (MAGIC_GGJT, v) => {
                Err(Error::UnsupportedVersion { magic, version: v })
            }
            _ => Err(Error::BadMagic(magic)),
        }
    }

    fn read_hparams(&mut self) -> Result<HParams> {
        let n_vocab = self.reader.read_u32::<LittleEndian>()?;
        let n_embd = self.reader.read_u32::<LittleEndian>()?;
        let n_mult = self.reader.read_u32::<LittleEndian>()?;
        let n_head = self.reader.read_u32::<LittleEndian>()?;
        let n_layer = self.reader.read_u32::<LittleEndian>()?;
        let n_rot = self.reader.read_u32::<LittleEndian>()?;
        let ftype = FType::from_u32(self.reader.read_u32::<LittleEndian>()?)?;
        Ok(HParams { n_vocab, n_embd, n_mult, n_head, n_layer, n_rot, ftype, ..HParams::default() })
    }

    fn read_vocab(&mut self, hparams: &HParams, version: FileVersion) -> Result<Vocabulary> {
        let mut vocab = Vocabulary::with_capacity(hparams.n_vocab as usize);
        for _ in 0..hparams.n_vocab {
            let len = self.reader.read_u32::<LittleEndian>()? as usize;
            let mut text = vec![0u8; len];
            self.reader.read_exact(&mut text)?;
            let score = if version >= FileVersion::GgmfV1 {
                self.reader.read_f32::<LittleEndian>()?
            } else {
                0.0
            };
            vocab.push(text, score);
        }
        Ok(vocab)
    }

    fn read_tensor_metadata(&mut self, version: FileVersion) -> Result<Vec<TensorDesc>> {
        let start = self.reader.stream_position()?;
        let file_size = self.reader.seek(SeekFrom::End(0))?;
        let mut pos = self.reader.seek(SeekFrom::Start(start))?;

        let mut tensors = Vec::new();
        while pos < file_size {
            let n_dims = self.reader.read_u32::<LittleEndian>()? as usize;
            let name_len = self.reader.read_u32::<LittleEndian>()? as usize;
            let dtype = TensorType::from_u32(self.reader.read_u32::<LittleEndian>()?)?;
            let mut ne = Vec::with_capacity(n_dims);
            for _ in 0..n_dims {
                ne.push(self.reader.read_u32::<LittleEndian>()?);
            }
            let mut name = vec![0u8; name_len];
            self.reader.read_exact(&mut name)?;
            let name = String::from_utf8(name)
                .map_err(|_| Error::InvalidParameter("tensor name is not UTF-8".into()))?;

            if version >= FileVersion::GgjtV1 {
                // skip to the next multiple of 32 bytes
                let cur = self.reader.stream_position()?;
                let aligned = (cur + TENSOR_ALIGN - 1) / TENSOR_ALIGN * TENSOR_ALIGN;
                self.reader.seek(SeekFrom::Start(aligned))?;
            }
            let file_off = self.reader.stream_position()?;
            let desc = TensorDesc::new(name, dtype, ne, file_off)?;
            pos = self.reader.seek(SeekFrom::Current(desc.size as i64))?;
            tensors.push(desc);
        }
        Ok(tensors)
    }

    /// Read `size` bytes of tensor payload at `offset`.
    pub fn read_tensor_data(&mut self, offset: u64, size: usize) -> Result<Vec<u8>> {
        self.reader.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; size];
        self.reader.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Read a tensor payload at `offset` directly into `buf`.
    pub fn read_tensor_into(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.reader.seek(SeekFrom::Start(offset))?;
        self.reader.read_exact(buf)?;
        Ok(())
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Ftypes allowed for a given file version; files older than GGJT v2 predate
/// one quantization format change and files older than v3 predate another.
pub fn check_ftype_supported(version: FileVersion, ftype: FType) -> Result<()> {
    if version < FileVersion::GgjtV2
        && !matches!(ftype, FType::AllF32 | FType::MostlyF16 | FType::MostlyQ8_0)
    {
        return Err(Error::UnsupportedFType(ftype as u32));
    }
    if version < FileVersion::GgjtV3
        && matches!(ftype, FType::MostlyQ4_0 | FType::MostlyQ4_1 | FType::MostlyQ8_0)
    {
        return Err(Error::UnsupportedFType(ftype as u32));
    }
    Ok(())
}

/// Writer producing GGJT v3 files.
pub struct GgjtWriter<W: Write + Seek> {
    writer: W,
}

impl<W: Write + Seek> GgjtWriter<W> {
    /// Write the preamble: magic/version, hyper-parameters with the new
    /// ftype, and the vocabulary. `source_version` drives the missing-scores
    /// warning for converted legacy files.
    pub fn new(
        mut writer: W,
        hparams: &HParams,
        vocab: &Vocabulary,
        new_ftype: FType,
        source_version: FileVersion,
    ) -> Result<Self> {
        writer.write_u32::<LittleEndian>(MAGIC_GGJT)?;
        writer.write_u32::<LittleEndian>(FILE_VERSION)?;

        writer.write_u32::<LittleEndian>(hparams.n_vocab)?;
        writer.write_u32::<LittleEndian>(hparams.n_embd)?;
        writer.write_u32::<LittleEndian>(hparams.n_mult)?;
        writer.write_u32::<LittleEndian>(hparams.n_head)?;
        writer.write_u32::<LittleEndian>(hparams.n_layer)?;
        writer.write_u32::<LittleEndian>(hparams.n_rot)?;
        writer.write_u32::<LittleEndian>(new_ftype as u32)?;

        if source_version == FileVersion::Ggml {
            log::warn!("input is an old file that doesn't have scores; will add dummy scores");
        }
        for entry in vocab.iter() {
            writer.write_u32::<LittleEndian>(entry.text.len() as u32)?;
            writer.write_all(&entry.text)?;
            writer.write_f32::<LittleEndian>(entry.score)?;
        }

        Ok(Self { writer })
    }

    /// Write one tensor: metadata block, alignment padding, payload.
    pub fn write_tensor(
        &mut self,
        name: &str,
        dtype: TensorType,
        ne: &[u32],
        data: &[u8],
    ) -> Result<()> {
        debug_assert_eq!(tensor_size(ne, dtype)? as usize, data.len());

        self.writer.write_u32::<LittleEndian>(ne.len() as u32)?;
        self.writer.write_u32::<LittleEndian>(name.len() as u32)?;
        self.writer.write_u32::<LittleEndian>(dtype as u32)?;
        for &dim in ne {
            self.writer.write_u32::<LittleEndian>(dim)?;
        }
        self.writer.write_all(name.as_bytes())?;

        let cur = self.writer.stream_position()?;
        let aligned = (cur + TENSOR_ALIGN - 1) / TENSOR_ALIGN * TENSOR_ALIGN;
        let pad = vec![0u8; (aligned - cur) as usize];
        self.writer.write_all(&pad)?;

        self.writer.write_all(data)?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn tiny_vocab() -> Vocabulary {
        let mut vocab = Vocabulary::default();
        vocab.push(b"<unk>".to_vec(), 0.0);
        vocab.push(b"<s>".to_vec(), -1.0);
        vocab.push(b"</s>".to_vec(), -2.0);
        vocab
    }

    fn tiny_hparams() -> HParams {
        HParams {
            n_vocab: 3,
            n_embd: 8,
            n_mult: 2,
            n_head: 2,
            n_layer: 1,
            n_rot: 4,
            ftype: FType::AllF32,
            ..HParams::default()
        }
    }

    #[test]
    fn writer_reader_round_trip() {
        let hparams = tiny_hparams();
        let vocab = tiny_vocab();
        let payload: Vec<u8> = (0..8 * 4).map(|i| i as u8).collect();

        let cursor = Cursor::new(Vec::new());
        let mut writer =
            GgjtWriter::new(cursor, &hparams, &vocab, FType::AllF32, FileVersion::GgjtV3).unwrap();
        writer.write_tensor("norm.weight", TensorType::F32, &[8], &payload).unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        let mut parser = GgjtParser::new(Cursor::new(bytes));
        let file = parser.parse().unwrap();

        assert_eq!(file.version, FileVersion::GgjtV3);
        assert_eq!(file.hparams.n_vocab, 3);
        assert_eq!(file.hparams.n_embd, 8);
        assert_eq!(file.vocab.find(b"</s>"), Some(2));
        assert_eq!(file.tensors.len(), 1);

        let t = &file.tensors[0];
        assert_eq!(t.name, "norm.weight");
        assert_eq!(t.ne, vec![8]);
        assert_eq!(t.size, 32);
        // payload alignment is part of the format
        assert_eq!(t.file_off % TENSOR_ALIGN, 0);

        let data = parser.read_tensor_data(t.file_off, t.size as usize).unwrap();
        assert_eq!(data, payload);
    }

    #[test]
    fn rejects_unknown_magic() {
        let mut parser = GgjtParser::new(Cursor::new(vec![1, 2, 3, 4, 0, 0, 0, 0]));
        assert!(matches!(parser.parse(), Err(Error::BadMagic(_))));
    }

    #[test]
    fn rejects_unknown_version() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&MAGIC_GGJT.to_le_bytes());
        bytes.extend_from_slice(&9u32.to_le_bytes());
        let mut parser = GgjtParser::new(Cursor::new(bytes));
        assert!(matches!(parser.parse(), Err(Error::UnsupportedVersion { version: 9, .. })));
    }

    #[test]
    fn version_gates() {
        // pre-v2 files may only be F32/F16/Q8_0
        assert!(check_ftype_supported(FileVersion::GgmfV1, FType::MostlyF16).is_ok());
        assert!(check_ftype_supported(FileVersion::GgmfV1, FType::MostlyQ4_0).is_err());
        // pre-v3 files may not use the reworked Q4/Q8 formats
        assert!(check_ftype_supported(FileVersion::GgjtV2, FType::MostlyQ8_0).is_err());
        assert!(check_ftype_supported(FileVersion::GgjtV2, FType::MostlyF16).is_ok());
        assert!(check_ftype_supported(FileVersion::GgjtV3, FType::MostlyQ4_0).is_ok());
    }

    #[test]
    fn derived_n_ff() {
        let hp = HParams { n_embd: 4096, n_mult: 256, ..HParams::default() };
        assert_eq!(hp.n_ff(), 11008);
    }
}
