use crate::backend::{Backend, FileKind, Handle};
use crate::blob::{Blob, BlobType};
use crate::crypto::{Key, EXTENSION};
use crate::error::{Result, SiloError};
use crate::id::{Id, ID_SIZE};

/// Size of one header entry: type tag, length, identifier.
pub const ENTRY_SIZE: usize = 1 + 4 + ID_SIZE;

/// Size of the trailing header-length field.
pub const HEADER_LEN_SIZE: usize = 4;

/// Upper bound on the encrypted header; anything larger is rejected as
/// corrupt before allocation.
pub const MAX_HEADER_SIZE: u32 = 16 * 1024 * 1024;

/// Number of header entries the eager tail read is sized for. Packs with at
/// most this many blobs are parsed with a single I/O request; larger packs
/// need one more. Correctness never depends on this value.
const EAGER_ENTRIES: usize = 15;

/// Parse the header of a pack file stored in `backend`, given its total
/// size. Returns the contained blobs with reconstructed offsets and the
/// header footprint (encrypted header plus length field).
pub fn parse_pack(
    backend: &dyn Backend,
    pack_id: &Id,
    key: &Key,
    size: u64,
) -> Result<(Vec<Blob>, u32)> {
    let min_size = (HEADER_LEN_SIZE + EXTENSION) as u64;
    if size < min_size {
        return Err(SiloError::HeaderTooShort);
    }

    let handle = Handle::new(FileKind::Pack, &pack_id.to_hex());
    let eager_size = ((EAGER_ENTRIES * ENTRY_SIZE + EXTENSION + HEADER_LEN_SIZE) as u64).min(size);
    let tail = backend.load(&handle, eager_size as u32, size - eager_size)?;

    let hlen = u32::from_le_bytes(
        tail[tail.len() - HEADER_LEN_SIZE..]
            .try_into()
            .expect("4-byte length field"),
    );
    if hlen > MAX_HEADER_SIZE {
        return Err(SiloError::HeaderTooLong(hlen));
    }
    if hlen as u64 + HEADER_LEN_SIZE as u64 > size || (hlen as usize) < EXTENSION {
        return Err(SiloError::HeaderTooShort);
    }

    let header_footprint = hlen + HEADER_LEN_SIZE as u32;
    let encrypted = if header_footprint as usize <= tail.len() {
        tail[tail.len() - header_footprint as usize..tail.len() - HEADER_LEN_SIZE].to_vec()
    } else {
        // header longer than the eager read: fetch exactly the missing range
        backend.load(&handle, hlen, size - header_footprint as u64)?
    };

    let plaintext = key.decrypt(&encrypted)?;
    let blobs = parse_header_entries(&plaintext)?;

    let body_len: u64 = blobs.iter().map(|b| b.length as u64).sum();
    if body_len + header_footprint as u64 > size {
        return Err(SiloError::Truncated);
    }

    Ok((blobs, header_footprint))
}

/// Parse a pack held entirely in memory (used when the whole file was
/// downloaded for verification anyway).
pub fn parse_pack_bytes(data: &[u8], key: &Key) -> Result<(Vec<Blob>, u32)> {
    if data.len() < HEADER_LEN_SIZE + EXTENSION {
        return Err(SiloError::HeaderTooShort);
    }
    let hlen = u32::from_le_bytes(
        data[data.len() - HEADER_LEN_SIZE..]
            .try_into()
            .expect("4-byte length field"),
    );
    if hlen > MAX_HEADER_SIZE {
        return Err(SiloError::HeaderTooLong(hlen));
    }
    let footprint = hlen as usize + HEADER_LEN_SIZE;
    if footprint > data.len() || (hlen as usize) < EXTENSION {
        return Err(SiloError::HeaderTooShort);
    }

    let encrypted = &data[data.len() - footprint..data.len() - HEADER_LEN_SIZE];
    let plaintext = key.decrypt(encrypted)?;
    let blobs = parse_header_entries(&plaintext)?;

    let body_len: u64 = blobs.iter().map(|b| b.length as u64).sum();
    if body_len + footprint as u64 > data.len() as u64 {
        return Err(SiloError::Truncated);
    }

    Ok((blobs, footprint as u32))
}

/// Decode fixed-size header entries, reconstructing offsets by running sum.
fn parse_header_entries(plaintext: &[u8]) -> Result<Vec<Blob>> {
    if plaintext.is_empty() || plaintext.len() % ENTRY_SIZE != 0 {
        return Err(SiloError::InvalidHeader(format!(
            "header length {} is not a multiple of {ENTRY_SIZE}",
            plaintext.len()
        )));
    }

    let mut blobs = Vec::with_capacity(plaintext.len() / ENTRY_SIZE);
    let mut offset: u64 = 0;
    for entry in plaintext.chunks_exact(ENTRY_SIZE) {
        let blob_type = BlobType::from_tag(entry[0])
            .ok_or_else(|| SiloError::InvalidHeader(format!("unknown blob tag {}", entry[0])))?;
        let length = u32::from_le_bytes(entry[1..5].try_into().expect("4-byte length"));
        if (length as usize) < EXTENSION {
            return Err(SiloError::InvalidHeader(format!(
                "blob length {length} below ciphertext overhead"
            )));
        }
        let mut id = [0u8; ID_SIZE];
        id.copy_from_slice(&entry[5..]);

        blobs.push(Blob {
            blob_type,
            id: Id(id),
            offset: u32::try_from(offset)
                .map_err(|_| SiloError::InvalidHeader("offset overflow".into()))?,
            length,
        });
        offset += length as u64;
    }
    Ok(blobs)
}

/// A finished pack, ready to be written under `id`.
pub struct FinishedPack {
    pub id: Id,
    pub bytes: Vec<u8>,
    pub blobs: Vec<Blob>,
}

/// Accumulates encrypted blobs and emits the final pack byte sequence:
/// body, encrypted header, little-endian header length.
pub struct Packer {
    body: Vec<u8>,
    entries: Vec<Blob>,
}

impl Packer {
    pub fn new() -> Self {
        Packer {
            body: Vec::new(),
            entries: Vec::new(),
        }
    }

    /// Encrypt `plaintext` under a fresh nonce and append it. Returns the
    /// stored length (plaintext plus ciphertext overhead).
    pub fn add(&mut self, key: &Key, blob_type: BlobType, id: Id, plaintext: &[u8]) -> Result<u32> {
        let offset = u32::try_from(self.body.len())
            .map_err(|_| SiloError::Other("pack body exceeds 4 GiB".into()))?;
        let stored = key.encrypt(plaintext);
        let length = stored.len() as u32;
        self.body.extend_from_slice(&stored);
        self.entries.push(Blob {
            blob_type,
            id,
            offset,
            length,
        });
        Ok(length)
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current size of the finished pack, header included.
    pub fn size(&self) -> u64 {
        self.body.len() as u64
            + (self.entries.len() * ENTRY_SIZE + EXTENSION + HEADER_LEN_SIZE) as u64
    }

    /// Whether this packer already holds a blob with the given id.
    pub fn contains(&self, id: &Id) -> bool {
        self.entries.iter().any(|b| &b.id == id)
    }

    /// Encrypt the header, append the length field, and name the pack by the
    /// hash of the complete byte sequence.
    pub fn finalize(self, key: &Key) -> Result<FinishedPack> {
        if self.entries.is_empty() {
            return Err(SiloError::Other("cannot finalize an empty pack".into()));
        }

        let mut header = Vec::with_capacity(self.entries.len() * ENTRY_SIZE);
        for blob in &self.entries {
            header.push(blob.blob_type.tag());
            header.extend_from_slice(&blob.length.to_le_bytes());
            header.extend_from_slice(blob.id.as_bytes());
        }

        let mut bytes = self.body;
        let encrypted_header = key.encrypt(&header);
        bytes.extend_from_slice(&encrypted_header);
        bytes.extend_from_slice(&(encrypted_header.len() as u32).to_le_bytes());

        Ok(FinishedPack {
            id: Id::hash(&bytes),
            bytes,
            blobs: self.entries,
        })
    }
}

impl Default for Packer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::testutil::{test_key, MemoryBackend};

    fn build_pack(key: &Key, blobs: &[(BlobType, &[u8])]) -> FinishedPack {
        let mut packer = Packer::new();
        for (blob_type, data) in blobs {
            packer.add(key, *blob_type, Id::hash(data), data).unwrap();
        }
        packer.finalize(key).unwrap()
    }

    #[test]
    fn roundtrip_three_blobs() {
        let key = test_key();
        let pack = build_pack(
            &key,
            &[
                (BlobType::Tree, b"a"),
                (BlobType::Data, b"bb"),
                (BlobType::Data, b"ccc"),
            ],
        );

        // body: (1+32) + (2+32) + (3+32); header: 3 entries + overhead + len
        assert_eq!(
            pack.bytes.len(),
            102 + 3 * ENTRY_SIZE + EXTENSION + HEADER_LEN_SIZE
        );
        assert_eq!(pack.id, Id::hash(&pack.bytes));

        let (blobs, footprint) = parse_pack_bytes(&pack.bytes, &key).unwrap();
        assert_eq!(footprint as usize, 3 * ENTRY_SIZE + EXTENSION + HEADER_LEN_SIZE);
        assert_eq!(blobs.len(), 3);

        let expected = [
            (BlobType::Tree, &b"a"[..], 0u32),
            (BlobType::Data, &b"bb"[..], 33),
            (BlobType::Data, &b"ccc"[..], 67),
        ];
        for (blob, (blob_type, plaintext, offset)) in blobs.iter().zip(expected) {
            assert_eq!(blob.blob_type, blob_type);
            assert_eq!(blob.id, Id::hash(plaintext));
            assert_eq!(blob.offset, offset);
            assert_eq!(blob.length as usize, plaintext.len() + EXTENSION);
        }
    }

    #[test]
    fn blobs_decrypt_from_parsed_offsets() {
        let key = test_key();
        let inputs: Vec<(BlobType, Vec<u8>)> = (0u8..20)
            .map(|i| (BlobType::Data, vec![i; (i as usize + 1) * 10]))
            .collect();
        let pack = {
            let mut packer = Packer::new();
            for (t, data) in &inputs {
                packer.add(&key, *t, Id::hash(data), data).unwrap();
            }
            packer.finalize(&key).unwrap()
        };

        let (blobs, _) = parse_pack_bytes(&pack.bytes, &key).unwrap();
        for (blob, (_, plaintext)) in blobs.iter().zip(&inputs) {
            let range =
                &pack.bytes[blob.offset as usize..(blob.offset + blob.length) as usize];
            let decrypted = key.decrypt(range).unwrap();
            assert_eq!(&decrypted, plaintext);
            assert_eq!(Id::hash(&decrypted), blob.id);
        }
    }

    #[test]
    fn parse_via_backend_uses_eager_read() {
        let key = test_key();
        let pack = build_pack(&key, &[(BlobType::Data, b"payload")]);

        let be = MemoryBackend::new();
        let handle = Handle::new(FileKind::Pack, &pack.id.to_hex());
        be.save(&handle, &pack.bytes).unwrap();

        let (blobs, footprint) =
            parse_pack(&be, &pack.id, &key, pack.bytes.len() as u64).unwrap();
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].id, Id::hash(b"payload"));
        assert_eq!(footprint as usize, ENTRY_SIZE + EXTENSION + HEADER_LEN_SIZE);
    }

    #[test]
    fn parse_large_header_needs_second_read() {
        let key = test_key();
        // more blobs than the eager read covers
        let inputs: Vec<Vec<u8>> = (0u16..40).map(|i| i.to_le_bytes().to_vec()).collect();
        let mut packer = Packer::new();
        for data in &inputs {
            packer.add(&key, BlobType::Data, Id::hash(data), data).unwrap();
        }
        let pack = packer.finalize(&key).unwrap();

        let be = MemoryBackend::new();
        be.save(&Handle::new(FileKind::Pack, &pack.id.to_hex()), &pack.bytes)
            .unwrap();

        let (blobs, _) = parse_pack(&be, &pack.id, &key, pack.bytes.len() as u64).unwrap();
        assert_eq!(blobs.len(), 40);
        for (blob, data) in blobs.iter().zip(&inputs) {
            assert_eq!(blob.id, Id::hash(data));
        }
    }

    #[test]
    fn rejects_undersized_pack() {
        let key = test_key();
        assert!(matches!(
            parse_pack_bytes(&[0u8; 10], &key),
            Err(SiloError::HeaderTooShort)
        ));
    }

    #[test]
    fn rejects_oversized_header_length() {
        let key = test_key();
        let mut data = vec![0u8; 64];
        let len = data.len();
        data[len - 4..].copy_from_slice(&(MAX_HEADER_SIZE + 1).to_le_bytes());
        assert!(matches!(
            parse_pack_bytes(&data, &key),
            Err(SiloError::HeaderTooLong(_))
        ));
    }

    #[test]
    fn rejects_header_longer_than_pack() {
        let key = test_key();
        let mut data = vec![0u8; 64];
        let len = data.len();
        data[len - 4..].copy_from_slice(&1000u32.to_le_bytes());
        assert!(matches!(
            parse_pack_bytes(&data, &key),
            Err(SiloError::HeaderTooShort)
        ));
    }

    #[test]
    fn rejects_corrupted_header() {
        let key = test_key();
        let pack = build_pack(&key, &[(BlobType::Data, b"x")]);
        let mut corrupted = pack.bytes.clone();
        // flip a bit inside the encrypted header
        let pos = corrupted.len() - HEADER_LEN_SIZE - 1;
        corrupted[pos] ^= 0x80;
        assert!(matches!(
            parse_pack_bytes(&corrupted, &key),
            Err(SiloError::DecryptionFailed)
        ));
    }

    #[test]
    fn rejects_unknown_blob_tag() {
        let key = test_key();
        // hand-build a header with tag 7
        let mut header = vec![7u8];
        header.extend_from_slice(&(EXTENSION as u32 + 1).to_le_bytes());
        header.extend_from_slice(Id::hash(b"z").as_bytes());

        let mut data = vec![0u8; 64];
        let encrypted = key.encrypt(&header);
        data.extend_from_slice(&encrypted);
        data.extend_from_slice(&(encrypted.len() as u32).to_le_bytes());

        assert!(matches!(
            parse_pack_bytes(&data, &key),
            Err(SiloError::InvalidHeader(_))
        ));
    }

    #[test]
    fn rejects_truncated_body() {
        let key = test_key();
        let pack = build_pack(&key, &[(BlobType::Data, b"0123456789")]);
        // drop the first body byte: declared lengths no longer fit
        let truncated = &pack.bytes[1..];
        assert!(matches!(
            parse_pack_bytes(truncated, &key),
            Err(SiloError::Truncated)
        ));
    }

    #[test]
    fn empty_packer_cannot_finalize() {
        let key = test_key();
        assert!(Packer::new().finalize(&key).is_err());
    }

    #[test]
    fn pack_id_depends_on_content() {
        let key = test_key();
        let a = build_pack(&key, &[(BlobType::Data, b"same")]);
        let b = build_pack(&key, &[(BlobType::Data, b"same")]);
        // ids differ because nonces differ, but each matches its own bytes
        assert_eq!(a.id, Id::hash(&a.bytes));
        assert_eq!(b.id, Id::hash(&b.bytes));
        assert_eq!(a.blobs[0].id, b.blobs[0].id);
    }
}
