//! Repository tag codec.
//!
//! The backing registry repository is a flat tag namespace, so tag
//! prefixes are the only reliable type tag. Every record kind the
//! repository stores is encoded into (and decoded from) a tag here, and
//! nowhere else, which keeps the prefix partition enforceable:
//!
//! - `<signature>-<unique_id>` - a cached build stage
//! - `managed-image-<slugged-name>` - a managed image marker
//! - `image-metadata-by-commit-<slugged-name>-<commit>` - per-commit metadata
//! - `client-id-<id>-<timestamp_ms>` - a client-id record
//!
//! A tag matching none of the reserved prefixes and failing the stage
//! parse is inert for record enumeration; those tags are where published
//! application images live.
//!
//! The stage unique id is a millisecond timestamp, so lexicographic tag
//! order is not temporal order - ordering always uses the parsed integer.

use sha2::{Digest, Sha256};

use stagehand_core::error::{Error, Result};

use crate::image::{ClientIdRecord, StageId};

/// Prefix of managed image record tags.
pub const MANAGED_IMAGE_TAG_PREFIX: &str = "managed-image-";

/// Prefix of per-commit image metadata record tags.
pub const IMAGE_METADATA_BY_COMMIT_TAG_PREFIX: &str = "image-metadata-by-commit-";

/// Prefix of client-id record tags.
pub const CLIENT_ID_TAG_PREFIX: &str = "client-id-";

/// Tag standing in for the empty image name in managed/metadata records.
pub const NAMELESS_IMAGE_RECORD_TAG: &str = "-nameless-image-";

/// Maximum length of any encoded tag.
pub const MAX_TAG_LENGTH: usize = 128;

const RESERVED_PREFIXES: [&str; 3] = [
    MANAGED_IMAGE_TAG_PREFIX,
    IMAGE_METADATA_BY_COMMIT_TAG_PREFIX,
    CLIENT_ID_TAG_PREFIX,
];

/// A decoded repository tag: the sum type over the flat namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoTag {
    /// A cached build stage.
    Stage(StageId),
    /// A managed image marker for the given (unslugged) image name.
    ManagedImage {
        /// The recorded image name; empty for the nameless image.
        name: String,
    },
    /// A per-commit metadata record.
    ///
    /// The name portion is kept slugged: the 128-char cap makes the slug
    /// lossy, so records are matched by re-encoding, never by decoding.
    ImageMetadata {
        /// The slugged (possibly shrunk) image name portion.
        slugged_name: String,
        /// The commit hash.
        commit: String,
    },
    /// A client-id record.
    ClientId(ClientIdRecord),
}

impl RepoTag {
    /// Decodes a tag into its record kind.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnexpectedTagFormat`] for tags matching no known
    /// record format. Enumeration code skips such tags.
    pub fn parse(tag: &str) -> Result<Self> {
        if let Some(slugged) = tag.strip_prefix(MANAGED_IMAGE_TAG_PREFIX) {
            return Ok(Self::ManagedImage {
                name: unslug_image_name(slugged),
            });
        }
        if let Some(rest) = tag.strip_prefix(IMAGE_METADATA_BY_COMMIT_TAG_PREFIX) {
            let (slugged_name, commit) = rest
                .rsplit_once('-')
                .ok_or_else(|| Error::unexpected_tag_format(tag))?;
            if slugged_name.is_empty() || commit.is_empty() {
                return Err(Error::unexpected_tag_format(tag));
            }
            return Ok(Self::ImageMetadata {
                slugged_name: slugged_name.to_string(),
                commit: commit.to_string(),
            });
        }
        if tag.starts_with(CLIENT_ID_TAG_PREFIX) {
            return decode_client_id(tag).map(Self::ClientId);
        }
        decode_stage(tag).map(Self::Stage)
    }

    /// Re-encodes the record into its tag form.
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Stage(stage_id) => encode_stage(&stage_id.signature, stage_id.unique_id),
            Self::ManagedImage { name } => encode_managed(name),
            Self::ImageMetadata {
                slugged_name,
                commit,
            } => format!("{IMAGE_METADATA_BY_COMMIT_TAG_PREFIX}{slugged_name}-{commit}"),
            Self::ClientId(record) => {
                encode_client_id(&record.client_id, record.timestamp_millis)
            }
        }
    }
}

/// Encodes a stage identity into its tag.
///
/// The unique id is a positive millisecond timestamp rendered in decimal.
#[must_use]
pub fn encode_stage(signature: &str, unique_id: i64) -> String {
    format!("{signature}-{unique_id}")
}

/// Decodes a stage tag into its identity.
///
/// # Errors
///
/// Returns [`Error::UnexpectedTagFormat`] when the tag has no dash, the
/// unique-id part is not a positive decimal integer, or the signature
/// collides with a reserved prefix.
pub fn decode_stage(tag: &str) -> Result<StageId> {
    let (signature, unique_id) = tag
        .split_once('-')
        .ok_or_else(|| Error::unexpected_tag_format(tag))?;
    if signature.is_empty() || signature_collides_with_reserved(signature) {
        return Err(Error::unexpected_tag_format(tag));
    }
    let unique_id: i64 = unique_id
        .parse()
        .map_err(|_| Error::unexpected_tag_format(tag))?;
    if unique_id <= 0 {
        return Err(Error::unexpected_tag_format(tag));
    }
    Ok(StageId {
        signature: signature.to_string(),
        unique_id,
    })
}

/// Returns whether a stage signature would collide with the reserved
/// record prefixes. Such signatures are rejected by the codec.
#[must_use]
pub fn signature_collides_with_reserved(signature: &str) -> bool {
    let tagged = format!("{signature}-");
    RESERVED_PREFIXES
        .iter()
        .any(|prefix| tagged.starts_with(prefix) || prefix.starts_with(&tagged))
}

/// Encodes a managed image record tag for the given image name.
#[must_use]
pub fn encode_managed(name: &str) -> String {
    format!("{MANAGED_IMAGE_TAG_PREFIX}{}", slug_image_name(name))
}

/// Decodes a managed image record tag back into the image name.
///
/// Returns `None` if the tag does not carry the managed prefix.
#[must_use]
pub fn decode_managed(tag: &str) -> Option<String> {
    tag.strip_prefix(MANAGED_IMAGE_TAG_PREFIX)
        .map(unslug_image_name)
}

/// Encodes a per-commit metadata record tag, honoring the tag length cap.
///
/// The unshrunk form is preferred. Over the cap, the name slug is shrunk
/// to make the tag exactly [`MAX_TAG_LENGTH`] and every `-` inside the
/// shrunk slug becomes `_` so the trailing commit delimiter stays
/// unambiguous.
#[must_use]
pub fn encode_metadata(name: &str, commit: &str) -> String {
    let slug = slug_image_name(name);
    let tag = format!("{IMAGE_METADATA_BY_COMMIT_TAG_PREFIX}{slug}-{commit}");
    if tag.len() <= MAX_TAG_LENGTH {
        return tag;
    }

    let excess = tag.len() - MAX_TAG_LENGTH;
    let target = slug.len().saturating_sub(excess);
    let shrunk = limited_slug(&slug, target).replace('-', "_");
    format!("{IMAGE_METADATA_BY_COMMIT_TAG_PREFIX}{shrunk}-{commit}")
}

/// Encodes a client-id record tag.
#[must_use]
pub fn encode_client_id(client_id: &str, timestamp_millis: i64) -> String {
    format!("{CLIENT_ID_TAG_PREFIX}{client_id}-{timestamp_millis}")
}

/// Decodes a client-id record tag.
///
/// The id itself may contain `-`, so the split runs right-to-left: the
/// last dash separates the id from the millisecond timestamp.
///
/// # Errors
///
/// Returns [`Error::UnexpectedTagFormat`] when the prefix or timestamp
/// is malformed.
pub fn decode_client_id(tag: &str) -> Result<ClientIdRecord> {
    let rest = tag
        .strip_prefix(CLIENT_ID_TAG_PREFIX)
        .ok_or_else(|| Error::unexpected_tag_format(tag))?;
    let (client_id, timestamp) = rest
        .rsplit_once('-')
        .ok_or_else(|| Error::unexpected_tag_format(tag))?;
    if client_id.is_empty() {
        return Err(Error::unexpected_tag_format(tag));
    }
    let timestamp_millis: i64 = timestamp
        .parse()
        .map_err(|_| Error::unexpected_tag_format(tag))?;
    Ok(ClientIdRecord {
        client_id: client_id.to_string(),
        timestamp_millis,
    })
}

/// Slugs an image name into valid tag characters.
///
/// `/` becomes `__slash__`, `+` becomes `__plus__`; the empty name maps
/// to [`NAMELESS_IMAGE_RECORD_TAG`].
#[must_use]
pub fn slug_image_name(name: &str) -> String {
    if name.is_empty() {
        return NAMELESS_IMAGE_RECORD_TAG.to_string();
    }
    name.replace('/', "__slash__").replace('+', "__plus__")
}

/// Reverses [`slug_image_name`].
#[must_use]
pub fn unslug_image_name(slug: &str) -> String {
    if slug == NAMELESS_IMAGE_RECORD_TAG {
        return String::new();
    }
    slug.replace("__slash__", "/").replace("__plus__", "+")
}

/// Validates an image name for record storage.
///
/// # Errors
///
/// Returns [`Error::Validation`] for names with upper-case characters.
pub fn validate_image_name(name: &str) -> Result<()> {
    if name.to_lowercase() != name {
        return Err(Error::Validation {
            message: format!("image name {name:?}: no upcase symbols allowed"),
        });
    }
    Ok(())
}

const SLUG_HASH_LEN: usize = 10;

/// Shrinks a slug to at most `target` bytes, keeping a stable hash
/// suffix so distinct long names stay distinct.
fn limited_slug(slug: &str, target: usize) -> String {
    if slug.len() <= target {
        return slug.to_string();
    }
    let digest = Sha256::digest(slug.as_bytes());
    let hash: String = digest
        .iter()
        .flat_map(|byte| [byte >> 4, byte & 0xf])
        .map(|nibble| char::from_digit(u32::from(nibble), 16).unwrap_or('0'))
        .take(SLUG_HASH_LEN)
        .collect();

    if target <= SLUG_HASH_LEN + 1 {
        return hash[..target.min(SLUG_HASH_LEN)].to_string();
    }
    let keep = floor_char_boundary(slug, target - SLUG_HASH_LEN - 1);
    format!("{}-{hash}", &slug[..keep])
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    index = index.min(s.len());
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_round_trip() {
        let tag = encode_stage("abc123", 1_700_000_000_000);
        assert_eq!(tag, "abc123-1700000000000");
        let stage_id = decode_stage(&tag).expect("decode");
        assert_eq!(stage_id.signature, "abc123");
        assert_eq!(stage_id.unique_id, 1_700_000_000_000);
        assert_eq!(encode_stage(&stage_id.signature, stage_id.unique_id), tag);
    }

    #[test]
    fn test_stage_rejects_noise() {
        assert!(decode_stage("noise").is_err());
        assert!(decode_stage("def-notanumber").is_err());
        assert!(decode_stage("sig--5").is_err());
        assert!(decode_stage("-1700000000000").is_err());
    }

    #[test]
    fn test_stage_rejects_reserved_signature() {
        let err = decode_stage("managed-image-1700000000000").expect_err("reserved");
        assert!(err.is_unexpected_tag_format());
        // The partial prefix "managed" also collides ("managed-" is a
        // prefix of "managed-image-").
        assert!(signature_collides_with_reserved("managed"));
        assert!(!signature_collides_with_reserved("abc123"));
    }

    #[test]
    fn test_managed_slug_round_trip() {
        let tag = encode_managed("backend/api+v2");
        assert_eq!(tag, "managed-image-backend__slash__api__plus__v2");
        assert_eq!(decode_managed(&tag).expect("managed"), "backend/api+v2");
    }

    #[test]
    fn test_nameless_image_record() {
        let tag = encode_managed("");
        assert_eq!(tag, "managed-image--nameless-image-");
        assert_eq!(decode_managed(&tag).expect("managed"), "");
    }

    #[test]
    fn test_client_id_round_trip_with_dashes() {
        let tag = encode_client_id("host-a-builder", 1_700_000_001_234);
        assert_eq!(tag, "client-id-host-a-builder-1700000001234");
        let record = decode_client_id(&tag).expect("decode");
        assert_eq!(record.client_id, "host-a-builder");
        assert_eq!(record.timestamp_millis, 1_700_000_001_234);
        assert_eq!(
            encode_client_id(&record.client_id, record.timestamp_millis),
            tag
        );
    }

    #[test]
    fn test_client_id_rejects_missing_timestamp() {
        assert!(decode_client_id("client-id-justanid").is_err());
    }

    #[test]
    fn test_metadata_short_name_unshrunken() {
        let commit = "0123456789abcdef0123456789abcdef01234567";
        let tag = encode_metadata("backend", commit);
        assert_eq!(tag, format!("image-metadata-by-commit-backend-{commit}"));
        assert!(tag.len() <= MAX_TAG_LENGTH);
    }

    #[test]
    fn test_metadata_cap_is_exact() {
        let name = "a".repeat(120);
        let commit = "0123456789abcdef0123456789abcdef01234567";
        let tag = encode_metadata(&name, commit);
        assert_eq!(tag.len(), MAX_TAG_LENGTH);
        assert!(tag.starts_with(IMAGE_METADATA_BY_COMMIT_TAG_PREFIX));
        assert!(tag.ends_with(&format!("-{commit}")));

        // The shrunk slug contains no dash: its hash separator was
        // rewritten to '_' to protect the commit delimiter.
        let middle = &tag[IMAGE_METADATA_BY_COMMIT_TAG_PREFIX.len()..tag.len() - commit.len() - 1];
        assert!(!middle.contains('-'));
    }

    #[test]
    fn test_metadata_cap_distinct_names_stay_distinct() {
        let commit = "0123456789abcdef0123456789abcdef01234567";
        let left = encode_metadata(&"a".repeat(150), commit);
        let right = encode_metadata(&format!("{}b", "a".repeat(149)), commit);
        assert_ne!(left, right);
        assert_eq!(left.len(), MAX_TAG_LENGTH);
        assert_eq!(right.len(), MAX_TAG_LENGTH);
    }

    #[test]
    fn test_metadata_fits_for_any_name_up_to_cap() {
        let commit = "f".repeat(40);
        for len in [0, 1, 61, 62, 63, 120, 300] {
            let name = "x".repeat(len);
            assert!(
                encode_metadata(&name, &commit).len() <= MAX_TAG_LENGTH,
                "name length {len} exceeded the cap"
            );
        }
    }

    #[test]
    fn test_parse_partitions_namespace() {
        let cases = [
            ("abc123-1700000000000", true),
            ("abc123-1700000001000", true),
            ("managed-image-myapp", true),
            ("client-id-builder-1700000000000", true),
            ("image-metadata-by-commit-myapp-deadbeef", true),
            ("noise", false),
            ("def-notanumber", false),
        ];
        for (tag, decodable) in cases {
            assert_eq!(RepoTag::parse(tag).is_ok(), decodable, "tag {tag}");
        }
    }

    #[test]
    fn test_parse_encode_round_trip() {
        for tag in [
            "abc123-1700000000000",
            "managed-image-backend__slash__api",
            "managed-image--nameless-image-",
            "client-id-host-a-1700000000000",
            "image-metadata-by-commit-myapp-deadbeef",
        ] {
            let decoded = RepoTag::parse(tag).expect("parse");
            assert_eq!(decoded.encode(), tag);
        }
    }

    #[test]
    fn test_validate_image_name() {
        assert!(validate_image_name("backend/api").is_ok());
        assert!(validate_image_name("").is_ok());
        assert!(validate_image_name("Backend").is_err());
    }
}
