//! Input validation shared by server and client

use crate::errors::ValidationError;
use crate::protocol::FileDescriptor;

/// MIME type assumed when an attachment names none
pub const DEFAULT_MIME: &str = "application/octet-stream";

/// Name given to an attachment that arrives without one
pub const DEFAULT_ATTACHMENT_NAME: &str = "file";

/// Trim a display name and check its length
pub fn normalize_username(raw: &str, max_len: usize) -> Result<String, ValidationError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(ValidationError::UsernameEmpty);
    }
    if name.chars().count() > max_len {
        return Err(ValidationError::UsernameTooLong { max: max_len });
    }
    Ok(name.to_string())
}

/// Trimmed message text; missing text reads as empty
pub fn normalize_text(raw: Option<&str>) -> String {
    raw.map(str::trim).unwrap_or_default().to_string()
}

/// Trim a private-message recipient, rejecting blanks
pub fn normalize_recipient(raw: &str) -> Result<String, ValidationError> {
    let recipient = raw.trim();
    if recipient.is_empty() {
        return Err(ValidationError::RecipientRequired);
    }
    Ok(recipient.to_string())
}

/// Reject files over `max` bytes
pub fn check_file_size(size: u64, max: u64) -> Result<(), ValidationError> {
    if size > max {
        return Err(ValidationError::FileTooLarge { size, max });
    }
    Ok(())
}

/// Limits applied to inline attachments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentLimits {
    pub max_file_bytes: u64,
    pub max_name_len: usize,
}

/// Clean up an attachment descriptor.
///
/// Name and MIME type are trimmed and truncated; inline data is checked
/// against the size limit by declared size and by encoded length. A
/// descriptor with neither inline data nor a transfer reference carries
/// nothing and is dropped.
pub fn sanitize_attachment(
    file: Option<FileDescriptor>,
    limits: AttachmentLimits,
) -> Result<Option<FileDescriptor>, ValidationError> {
    let Some(file) = file else {
        return Ok(None);
    };

    let data = file.data.filter(|data| !data.trim().is_empty());
    if data.is_none() && file.transfer_id.is_none() {
        return Ok(None);
    }

    let name = truncate_chars(file.name.trim(), limits.max_name_len);
    let mime = truncate_chars(file.mime.trim(), limits.max_name_len);

    let mut size = file.size;
    if let Some(data) = &data {
        let encoded_cap = limits.max_file_bytes.saturating_mul(4) / 3 + 8;
        let encoded_len = data.len() as u64;
        if encoded_len > encoded_cap {
            return Err(ValidationError::FileTooLarge {
                size: encoded_len * 3 / 4,
                max: limits.max_file_bytes,
            });
        }
        if size == 0 {
            size = encoded_len * 3 / 4;
        }
    }
    check_file_size(size, limits.max_file_bytes)?;

    Ok(Some(FileDescriptor {
        name: if name.is_empty() {
            DEFAULT_ATTACHMENT_NAME.to_string()
        } else {
            name
        },
        mime: if mime.is_empty() {
            DEFAULT_MIME.to_string()
        } else {
            mime
        },
        size,
        data,
        transfer_id: file.transfer_id,
    }))
}

fn truncate_chars(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}
