//! Per-call option resolution.
//!
//! Callers pass slices of `OpenOption` / `CopyOption`; these are validated
//! once into an immutable `OpenOptions` / `CopyOptions` record before any
//! network round trip happens.

use crate::ftpfs::error::{FtpError, FtpResult};
use crate::ftpfs::types::{FileStructure, FileTransferMode, FileType};
use serde::{Deserialize, Serialize};

/// Options accepted when opening a stream or channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OpenOption {
    Read,
    Write,
    Append,
    TruncateExisting,
    Create,
    CreateNew,
    DeleteOnClose,
    Sparse,
    Sync,
    Dsync,
    NoFollowLinks,
    FileType(FileType),
    FileStructure(FileStructure),
    FileTransferMode(FileTransferMode),
}

/// Options accepted by copy and move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CopyOption {
    ReplaceExisting,
    CopyAttributes,
    AtomicMove,
    NoFollowLinks,
    FileType(FileType),
    FileStructure(FileStructure),
    FileTransferMode(FileTransferMode),
}

/// Transfer-option overrides for one call. `None` means "use the file
/// system default".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferOptions {
    pub file_type: Option<FileType>,
    pub file_structure: Option<FileStructure>,
    pub file_transfer_mode: Option<FileTransferMode>,
}

fn set_once<T: PartialEq + Copy + std::fmt::Debug>(
    slot: &mut Option<T>,
    value: T,
    category: &str,
) -> FtpResult<()> {
    match slot {
        Some(existing) if *existing != value => Err(FtpError::illegal_argument(format!(
            "Conflicting {} options: {:?} and {:?}",
            category, existing, value
        ))),
        _ => {
            *slot = Some(value);
            Ok(())
        }
    }
}

impl TransferOptions {
    pub fn set_file_type(&mut self, value: FileType) -> FtpResult<()> {
        set_once(&mut self.file_type, value, "file type")
    }

    pub fn set_file_structure(&mut self, value: FileStructure) -> FtpResult<()> {
        set_once(&mut self.file_structure, value, "file structure")
    }

    pub fn set_file_transfer_mode(&mut self, value: FileTransferMode) -> FtpResult<()> {
        set_once(&mut self.file_transfer_mode, value, "file transfer mode")
    }

    /// Consumes transfer options; `Ok(false)` for anything else.
    fn accept_open(&mut self, option: &OpenOption) -> FtpResult<bool> {
        match *option {
            OpenOption::FileType(v) => self.set_file_type(v)?,
            OpenOption::FileStructure(v) => self.set_file_structure(v)?,
            OpenOption::FileTransferMode(v) => self.set_file_transfer_mode(v)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn accept_copy(&mut self, option: &CopyOption) -> FtpResult<bool> {
        match *option {
            CopyOption::FileType(v) => self.set_file_type(v)?,
            CopyOption::FileStructure(v) => self.set_file_structure(v)?,
            CopyOption::FileTransferMode(v) => self.set_file_transfer_mode(v)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn to_open_options(self) -> Vec<OpenOption> {
        let mut out = Vec::with_capacity(3);
        if let Some(v) = self.file_type {
            out.push(OpenOption::FileType(v));
        }
        if let Some(v) = self.file_structure {
            out.push(OpenOption::FileStructure(v));
        }
        if let Some(v) = self.file_transfer_mode {
            out.push(OpenOption::FileTransferMode(v));
        }
        out
    }
}

fn is_ignored(option: &OpenOption) -> bool {
    matches!(
        option,
        OpenOption::Sparse | OpenOption::Sync | OpenOption::Dsync | OpenOption::NoFollowLinks
    )
}

fn unsupported_open(option: &OpenOption) -> FtpError {
    FtpError::unsupported(format!("Unsupported open option: {:?}", option))
}

fn unsupported_copy(option: &CopyOption) -> FtpError {
    FtpError::unsupported(format!("Unsupported copy option: {:?}", option))
}

/// Resolved open flags plus transfer overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenOptions {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub truncate_existing: bool,
    pub create: bool,
    pub create_new: bool,
    pub delete_on_close: bool,
    pub transfer: TransferOptions,
}

impl OpenOptions {
    pub fn for_new_input_stream(options: &[OpenOption]) -> FtpResult<Self> {
        let mut resolved = Self {
            read: true,
            ..Self::default()
        };
        for option in options {
            if resolved.transfer.accept_open(option)? {
                continue;
            }
            match option {
                OpenOption::DeleteOnClose => resolved.delete_on_close = true,
                OpenOption::Read | OpenOption::TruncateExisting => {}
                o if is_ignored(o) => {}
                o => return Err(unsupported_open(o)),
            }
        }
        Ok(resolved)
    }

    /// An empty slice means create + truncate-existing + write.
    pub fn for_new_output_stream(options: &[OpenOption]) -> FtpResult<Self> {
        const DEFAULTS: [OpenOption; 3] = [
            OpenOption::Create,
            OpenOption::TruncateExisting,
            OpenOption::Write,
        ];
        let options = if options.is_empty() { &DEFAULTS[..] } else { options };

        let mut resolved = Self {
            write: true,
            ..Self::default()
        };
        for option in options {
            if resolved.transfer.accept_open(option)? {
                continue;
            }
            match option {
                OpenOption::Write => {}
                OpenOption::Append => resolved.append = true,
                OpenOption::TruncateExisting => resolved.truncate_existing = true,
                OpenOption::Create => resolved.create = true,
                OpenOption::CreateNew => resolved.create_new = true,
                OpenOption::DeleteOnClose => resolved.delete_on_close = true,
                o if is_ignored(o) => {}
                o => return Err(unsupported_open(o)),
            }
        }
        if resolved.append && resolved.truncate_existing {
            return Err(FtpError::illegal_argument(
                "Append and TruncateExisting cannot be combined",
            ));
        }
        Ok(resolved)
    }

    /// Channels are read-only or write-only. Without write/append the
    /// channel reads.
    pub fn for_new_channel(options: &[OpenOption]) -> FtpResult<Self> {
        let mut resolved = Self::default();
        for option in options {
            if resolved.transfer.accept_open(option)? {
                continue;
            }
            match option {
                OpenOption::Read => resolved.read = true,
                OpenOption::Write => resolved.write = true,
                OpenOption::Append => resolved.append = true,
                OpenOption::TruncateExisting => resolved.truncate_existing = true,
                OpenOption::Create => resolved.create = true,
                OpenOption::CreateNew => resolved.create_new = true,
                OpenOption::DeleteOnClose => resolved.delete_on_close = true,
                o if is_ignored(o) => {}
                o => return Err(unsupported_open(o)),
            }
        }

        if resolved.append {
            resolved.write = true;
        }
        if !resolved.write {
            resolved.read = true;
        }
        if resolved.read && (resolved.write || resolved.create || resolved.create_new) {
            return Err(FtpError::illegal_argument(
                "A channel can be opened for reading or writing, not both",
            ));
        }
        if resolved.append && resolved.truncate_existing {
            return Err(FtpError::illegal_argument(
                "Append and TruncateExisting cannot be combined",
            ));
        }
        Ok(resolved)
    }

    /// Whether `open_write` must look the target up first.
    pub(crate) fn requires_existence_check(&self) -> bool {
        !(self.create && !self.create_new)
    }
}

/// Resolved copy / move options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyOptions {
    pub replace_existing: bool,
    pub transfer: TransferOptions,
}

impl CopyOptions {
    pub fn for_copy(options: &[CopyOption]) -> FtpResult<Self> {
        let mut resolved = Self::default();
        for option in options {
            if resolved.transfer.accept_copy(option)? {
                continue;
            }
            match option {
                CopyOption::ReplaceExisting => resolved.replace_existing = true,
                CopyOption::NoFollowLinks => {}
                o => return Err(unsupported_copy(o)),
            }
        }
        Ok(resolved)
    }

    /// `AtomicMove` is honoured only within one file system, where the
    /// move is a single rename.
    pub fn for_move(same_file_system: bool, options: &[CopyOption]) -> FtpResult<Self> {
        let mut resolved = Self::default();
        for option in options {
            if resolved.transfer.accept_copy(option)? {
                continue;
            }
            match option {
                CopyOption::ReplaceExisting => resolved.replace_existing = true,
                CopyOption::NoFollowLinks => {}
                CopyOption::AtomicMove if same_file_system => {}
                o => return Err(unsupported_copy(o)),
            }
        }
        Ok(resolved)
    }

    pub fn input_options(&self) -> FtpResult<OpenOptions> {
        let mut options = self.transfer.to_open_options();
        options.push(OpenOption::Read);
        OpenOptions::for_new_input_stream(&options)
    }

    pub fn output_options(&self) -> FtpResult<OpenOptions> {
        let mut options = self.transfer.to_open_options();
        options.extend([OpenOption::Write, OpenOption::Create]);
        OpenOptions::for_new_output_stream(&options)
    }
}
