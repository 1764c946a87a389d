//! Session files: a framed snapshot of the prompt tokens plus (eventually)
//! the full context state.
//!
//! The state blob itself is not serialized yet; the framing is fixed so the
//! on-disk layout will not change when it is. Loading a file that carries a
//! state blob reports `Unimplemented` rather than guessing at its contents.

use crate::context::Context;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ggjt_core::error::{Error, Result};
use ggjt_core::formats::ggjt::HParams;
use ggjt_core::vocab::TokenId;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, Write};
use std::path::Path;

pub const SESSION_MAGIC: u32 = 0x6767_736e; // 'ggsn'
pub const SESSION_VERSION: u32 = 1;

fn write_hparams<W: Write>(w: &mut W, hp: &HParams) -> Result<()> {
    w.write_u32::<LittleEndian>(hp.n_vocab)?;
    w.write_u32::<LittleEndian>(hp.n_ctx)?;
    w.write_u32::<LittleEndian>(hp.n_embd)?;
    w.write_u32::<LittleEndian>(hp.n_mult)?;
    w.write_u32::<LittleEndian>(hp.n_head)?;
    w.write_u32::<LittleEndian>(hp.n_layer)?;
    w.write_u32::<LittleEndian>(hp.n_rot)?;
    w.write_f32::<LittleEndian>(hp.rope_freq_base)?;
    w.write_f32::<LittleEndian>(hp.rope_freq_scale)?;
    w.write_u32::<LittleEndian>(hp.ftype as u32)?;
    Ok(())
}

fn read_hparams_raw<R: Read>(r: &mut R) -> Result<[u32; 10]> {
    let mut fields = [0u32; 10];
    for f in fields.iter_mut() {
        *f = r.read_u32::<LittleEndian>()?;
    }
    Ok(fields)
}

fn hparams_raw(hp: &HParams) -> [u32; 10] {
    [
        hp.n_vocab,
        hp.n_ctx,
        hp.n_embd,
        hp.n_mult,
        hp.n_head,
        hp.n_layer,
        hp.n_rot,
        hp.rope_freq_base.to_bits(),
        hp.rope_freq_scale.to_bits(),
        hp.ftype as u32,
    ]
}

impl Context {
    /// Maximum serialized size of the context state.
    ///
    /// The state blob is not implemented yet, so no size is reported.
    pub fn state_size(&self) -> Result<usize> {
        Err(Error::Unimplemented("context state serialization"))
    }

    pub fn copy_state_data(&self, _dst: &mut [u8]) -> Result<usize> {
        Err(Error::Unimplemented("context state serialization"))
    }

    pub fn set_state_data(&mut self, _src: &[u8]) -> Result<usize> {
        Err(Error::Unimplemented("context state serialization"))
    }

    /// Write a session file holding the prompt `tokens`.
    pub fn save_session_file(&self, path: impl AsRef<Path>, tokens: &[TokenId]) -> Result<()> {
        let mut w = BufWriter::new(File::create(path.as_ref())?);
        w.write_u32::<LittleEndian>(SESSION_MAGIC)?;
        w.write_u32::<LittleEndian>(SESSION_VERSION)?;
        write_hparams(&mut w, &self.model().hparams)?;

        w.write_u32::<LittleEndian>(tokens.len() as u32)?;
        for &t in tokens {
            w.write_i32::<LittleEndian>(t)?;
        }
        // state blob would follow here
        w.flush()?;
        Ok(())
    }

    /// Read a session file back, returning the stored prompt tokens.
    pub fn load_session_file(&mut self, path: impl AsRef<Path>) -> Result<Vec<TokenId>> {
        let file = File::open(path.as_ref())?;
        let size = file.metadata()?.len();
        let mut r = BufReader::new(file);

        let magic = r.read_u32::<LittleEndian>()?;
        let version = r.read_u32::<LittleEndian>()?;
        if magic != SESSION_MAGIC {
            return Err(Error::BadMagic(magic));
        }
        if version != SESSION_VERSION {
            return Err(Error::UnsupportedVersion { magic, version });
        }

        let stored = read_hparams_raw(&mut r)?;
        if stored != hparams_raw(&self.model().hparams) {
            return Err(Error::InvalidParameter(
                "model hparams didn't match from session file".into(),
            ));
        }

        let n_tokens = r.read_u32::<LittleEndian>()? as usize;
        if n_tokens > self.n_ctx() {
            return Err(Error::InvalidParameter(format!(
                "token count in session file exceeded capacity: {} > {}",
                n_tokens,
                self.n_ctx()
            )));
        }
        let mut tokens = Vec::with_capacity(n_tokens);
        for _ in 0..n_tokens {
            tokens.push(r.read_i32::<LittleEndian>()?);
        }

        let pos = r.stream_position()?;
        if pos < size {
            // a state blob is present but deserialization is not implemented
            return Err(Error::Unimplemented("session state restore"));
        }
        Ok(tokens)
    }
}
