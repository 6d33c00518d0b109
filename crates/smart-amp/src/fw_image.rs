//! Streaming decoder for the vendor firmware-image container.
//!
//! A firmware image arrives from the host's storage in bounded chunks; the
//! decoder never sees (or needs) the whole file. Layout, all words
//! little-endian:
//!
//! ```text
//! [0..32]   header      magic 0x54B998FF, format rev, image size,
//!                       symbol count, alg-ID count, fw ID, fw version,
//!                       data-block count
//! [..]      symbols     count × { symbol ID, chip address }
//! [..]      alg IDs     count × u32
//! [..]      blocks      count × { size, address, `size` payload bytes }
//! [..]      footer      magic 0x936BE2A6, checksum
//! ```
//!
//! Decoding is restartable at every byte boundary: [`FwImageDecoder::process`]
//! consumes as much of the current chunk as it can and hands control back
//! with [`Decode::NeedData`] when it runs dry, or [`Decode::BlockReady`] when
//! a complete data block is staged for transmission to the chip. The caller
//! owns every buffer; the decoder allocates nothing and holds no state across
//! images — a fresh image means a fresh decoder.
//!
//! The footer magic is the only integrity check performed here. The declared
//! checksum is surfaced in [`Decode::Complete`] and a running CRC32 of the
//! body is available from [`FwImageDecoder::computed_checksum`]; comparing
//! the two is the caller's decision.

// Cursor and offset arithmetic throughout is bounded by slice lengths
// checked at each step.
#![allow(clippy::arithmetic_side_effects)]

/// First magic word, at byte offset 0 of every image.
pub const FW_IMG_MAGIC: u32 = 0x54B9_98FF;
/// Second magic word, opening the footer.
pub const FW_IMG_FOOTER_MAGIC: u32 = 0x936B_E2A6;

/// Little-endian u32 at word index `i` of `buf`; zero if out of bounds
/// (callers stage exact sizes before decoding).
fn word(buf: &[u8], i: usize) -> u32 {
    let mut bytes = [0u8; 4];
    if let Some(src) = buf.get(i * 4..i * 4 + 4) {
        bytes.copy_from_slice(src);
    }
    u32::from_le_bytes(bytes)
}

/// Errors that abort decoding. The decoder is unusable afterwards; build a
/// new one to retry with a fresh image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ImageError {
    /// First magic word mismatch; the found value is carried for diagnostics.
    HeaderMagic(u32),
    /// Footer magic word mismatch; the found value is carried for diagnostics.
    FooterMagic(u32),
    /// The first chunk holds fewer bytes than a complete header.
    Truncated,
    /// Symbol or algorithm table smaller than the header-declared counts.
    TableTooSmall,
    /// A declared block size exceeds the caller's scratch capacity. The
    /// decoder never resizes or allocates.
    BlockTooLarge {
        /// Declared payload size of the offending block.
        size: u32,
        /// Capacity of the caller-provided scratch buffer.
        capacity: usize,
    },
}

/// Fixed-size image header (32 bytes on the wire).
///
/// The magic word is validated and discarded during [`FwImageHeader::read`];
/// everything else is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FwImageHeader {
    /// Container format revision.
    pub format_rev: u32,
    /// Total image size in bytes, header and footer included.
    pub image_size: u32,
    /// Number of symbol-table entries that follow the header.
    pub sym_count: u32,
    /// Number of algorithm IDs that follow the symbol table.
    pub alg_count: u32,
    /// Firmware identifier (selects runtime vs. calibration images).
    pub fw_id: u32,
    /// Firmware version.
    pub fw_rev: u32,
    /// Number of addressed data blocks in the body.
    pub data_blocks: u32,
}

impl FwImageHeader {
    /// Serialized header size in bytes.
    pub const SIZE: usize = 32;

    /// Consume exactly [`SIZE`](Self::SIZE) bytes from the front of the
    /// first chunk and validate the magic word.
    ///
    /// On failure nothing is consumed — the chunk is left untouched so the
    /// caller can inspect or log the offending bytes.
    ///
    /// # Errors
    ///
    /// [`ImageError::Truncated`] if the chunk is shorter than a header;
    /// [`ImageError::HeaderMagic`] on a magic mismatch.
    pub fn read(chunk: &mut &[u8]) -> Result<Self, ImageError> {
        if chunk.len() < Self::SIZE {
            return Err(ImageError::Truncated);
        }
        let (head, rest) = chunk.split_at(Self::SIZE);
        let magic = word(head, 0);
        if magic != FW_IMG_MAGIC {
            return Err(ImageError::HeaderMagic(magic));
        }
        let header = Self {
            format_rev: word(head, 1),
            image_size: word(head, 2),
            sym_count: word(head, 3),
            alg_count: word(head, 4),
            fw_id: word(head, 5),
            fw_rev: word(head, 6),
            data_blocks: word(head, 7),
        };
        *chunk = rest;
        Ok(header)
    }
}

/// One symbol-table entry: a firmware symbol ID and the chip address where
/// the firmware placed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SymbolEntry {
    /// Firmware symbol identifier (see `registers::SYM_ID_*`).
    pub id: u32,
    /// Control-port address of the symbol's XM word.
    pub address: u32,
}

/// One data-block header: payload size and destination chip address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BlockHeader {
    /// Payload size in bytes.
    pub size: u32,
    /// Destination address for the block write.
    pub address: u32,
}

/// Caller-owned output buffers, sized from the header.
///
/// `symbols` and `alg_ids` must hold at least the header-declared counts;
/// `scratch` must hold the image's largest declared block (a too-small
/// scratch is only detectable per block, and fails decoding there).
pub struct DecodeBuffers<'b> {
    /// Destination for the symbol table.
    pub symbols: &'b mut [SymbolEntry],
    /// Destination for the algorithm-ID list.
    pub alg_ids: &'b mut [u32],
    /// Staging area for one data block at a time.
    pub scratch: &'b mut [u8],
}

/// Caller-visible outcome of one [`FwImageDecoder::process`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Decode {
    /// The chunk is exhausted; feed the next one.
    NeedData,
    /// A complete data block is staged — transmit it via
    /// [`FwImageDecoder::staged_block`], then call `process` again with the
    /// same (possibly empty) chunk to continue.
    BlockReady,
    /// The image decoded cleanly. `checksum` is the footer's declared value.
    Complete {
        /// Declared checksum from the image footer.
        checksum: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Symbols,
    AlgIds,
    BlockHeader,
    BlockData,
    Footer,
    Done,
}

/// Incremental image decoder. See the module docs for the protocol.
pub struct FwImageDecoder<'b> {
    state: DecodeState,
    header: FwImageHeader,
    symbols: &'b mut [SymbolEntry],
    alg_ids: &'b mut [u32],
    scratch: &'b mut [u8],
    // Per-record staging: symbol entries, alg IDs, block headers and the
    // footer may all straddle chunk boundaries.
    staging: [u8; 8],
    staged: usize,
    index: usize,
    block: BlockHeader,
    filled: usize,
    blocks_done: u32,
    block_pending: bool,
    declared_checksum: u32,
    crc: crc32fast::Hasher,
}

impl<'b> FwImageDecoder<'b> {
    /// Build a decoder for the image described by `header`.
    ///
    /// # Errors
    ///
    /// [`ImageError::TableTooSmall`] if the symbol or algorithm buffers
    /// cannot hold the header-declared counts.
    pub fn new(header: &FwImageHeader, buffers: DecodeBuffers<'b>) -> Result<Self, ImageError> {
        if buffers.symbols.len() < header.sym_count as usize
            || buffers.alg_ids.len() < header.alg_count as usize
        {
            return Err(ImageError::TableTooSmall);
        }
        Ok(Self {
            state: DecodeState::Symbols,
            header: *header,
            symbols: buffers.symbols,
            alg_ids: buffers.alg_ids,
            scratch: buffers.scratch,
            staging: [0u8; 8],
            staged: 0,
            index: 0,
            block: BlockHeader::default(),
            filled: 0,
            blocks_done: 0,
            block_pending: false,
            declared_checksum: 0,
            crc: crc32fast::Hasher::new(),
        })
    }

    /// The header this decoder was built from.
    #[must_use]
    pub fn header(&self) -> &FwImageHeader {
        &self.header
    }

    /// The block staged by the last [`Decode::BlockReady`], if still pending.
    #[must_use]
    pub fn staged_block(&self) -> Option<(u32, &[u8])> {
        if !self.block_pending {
            return None;
        }
        self.scratch
            .get(..self.block.size as usize)
            .map(|data| (self.block.address, data))
    }

    /// Running CRC32 over every body byte consumed so far (header and footer
    /// excluded). After [`Decode::Complete`], compare against the declared
    /// checksum if end-to-end integrity matters to the caller.
    #[must_use]
    pub fn computed_checksum(&self) -> u32 {
        self.crc.clone().finalize()
    }

    /// Top up the staging buffer to `need` bytes from `chunk`, advancing the
    /// chunk in place. Returns true once `need` bytes are staged.
    fn fill_staging(&mut self, chunk: &mut &[u8], need: usize, hash: bool) -> bool {
        let want = need.saturating_sub(self.staged);
        let take = want.min(chunk.len());
        let (head, rest) = chunk.split_at(take);
        if let Some(dst) = self.staging.get_mut(self.staged..self.staged + take) {
            dst.copy_from_slice(head);
        }
        if hash {
            self.crc.update(head);
        }
        self.staged += take;
        *chunk = rest;
        self.staged == need
    }

    /// Advance the decoder as far as the chunk allows, consuming it in place.
    ///
    /// Drive to completion by looping: feed the next chunk on
    /// [`Decode::NeedData`], transmit and re-enter on [`Decode::BlockReady`]
    /// (the decoder does not move past the current block until re-entered),
    /// and stop on [`Decode::Complete`] or any error.
    ///
    /// # Errors
    ///
    /// [`ImageError::FooterMagic`] or [`ImageError::BlockTooLarge`]; both
    /// leave the decoder unusable.
    pub fn process(&mut self, chunk: &mut &[u8]) -> Result<Decode, ImageError> {
        loop {
            match self.state {
                DecodeState::Symbols => {
                    if self.index >= self.header.sym_count as usize {
                        self.index = 0;
                        self.state = DecodeState::AlgIds;
                        continue;
                    }
                    if !self.fill_staging(chunk, 8, true) {
                        return Ok(Decode::NeedData);
                    }
                    if let Some(slot) = self.symbols.get_mut(self.index) {
                        *slot = SymbolEntry {
                            id: word(&self.staging, 0),
                            address: word(&self.staging, 1),
                        };
                    }
                    self.index += 1;
                    self.staged = 0;
                }
                DecodeState::AlgIds => {
                    if self.index >= self.header.alg_count as usize {
                        self.index = 0;
                        self.state = DecodeState::BlockHeader;
                        continue;
                    }
                    if !self.fill_staging(chunk, 4, true) {
                        return Ok(Decode::NeedData);
                    }
                    if let Some(slot) = self.alg_ids.get_mut(self.index) {
                        *slot = word(&self.staging, 0);
                    }
                    self.index += 1;
                    self.staged = 0;
                }
                DecodeState::BlockHeader => {
                    if self.blocks_done >= self.header.data_blocks {
                        self.state = DecodeState::Footer;
                        continue;
                    }
                    if !self.fill_staging(chunk, 8, true) {
                        return Ok(Decode::NeedData);
                    }
                    self.block = BlockHeader {
                        size: word(&self.staging, 0),
                        address: word(&self.staging, 1),
                    };
                    self.staged = 0;
                    if self.block.size as usize > self.scratch.len() {
                        return Err(ImageError::BlockTooLarge {
                            size: self.block.size,
                            capacity: self.scratch.len(),
                        });
                    }
                    self.filled = 0;
                    self.state = DecodeState::BlockData;
                }
                DecodeState::BlockData => {
                    if self.block_pending {
                        // The staged block has been transmitted; move on.
                        self.block_pending = false;
                        self.blocks_done += 1;
                        self.state = DecodeState::BlockHeader;
                        continue;
                    }
                    let need = (self.block.size as usize).saturating_sub(self.filled);
                    let take = need.min(chunk.len());
                    let (head, rest) = chunk.split_at(take);
                    if let Some(dst) = self.scratch.get_mut(self.filled..self.filled + take) {
                        dst.copy_from_slice(head);
                    }
                    self.crc.update(head);
                    self.filled += take;
                    *chunk = rest;
                    if self.filled == self.block.size as usize {
                        self.block_pending = true;
                        return Ok(Decode::BlockReady);
                    }
                    return Ok(Decode::NeedData);
                }
                DecodeState::Footer => {
                    if !self.fill_staging(chunk, 8, false) {
                        return Ok(Decode::NeedData);
                    }
                    let magic = word(&self.staging, 0);
                    if magic != FW_IMG_FOOTER_MAGIC {
                        return Err(ImageError::FooterMagic(magic));
                    }
                    self.declared_checksum = word(&self.staging, 1);
                    self.staged = 0;
                    self.state = DecodeState::Done;
                    return Ok(Decode::Complete {
                        checksum: self.declared_checksum,
                    });
                }
                DecodeState::Done => {
                    return Ok(Decode::Complete {
                        checksum: self.declared_checksum,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Tests use unwrap() for readable assertions
#[allow(clippy::indexing_slicing, clippy::panic)] // fixed-size fixtures
mod tests {
    use super::*;

    fn push_word(out: &mut Vec<u8>, value: u32) {
        out.extend_from_slice(&value.to_le_bytes());
    }

    /// Serialize a complete image: header, symbols, alg IDs, blocks, footer.
    fn build_image(symbols: &[(u32, u32)], algs: &[u32], blocks: &[(u32, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for &(id, address) in symbols {
            push_word(&mut body, id);
            push_word(&mut body, address);
        }
        for &alg in algs {
            push_word(&mut body, alg);
        }
        for &(address, payload) in blocks {
            push_word(&mut body, payload.len() as u32);
            push_word(&mut body, address);
            body.extend_from_slice(payload);
        }

        let total = FwImageHeader::SIZE + body.len() + 8;
        let mut image = Vec::new();
        push_word(&mut image, FW_IMG_MAGIC);
        push_word(&mut image, 1); // format rev
        push_word(&mut image, total as u32);
        push_word(&mut image, symbols.len() as u32);
        push_word(&mut image, algs.len() as u32);
        push_word(&mut image, 0x0017_0A00); // fw id
        push_word(&mut image, 0x0001_0203); // fw version
        push_word(&mut image, blocks.len() as u32);
        image.extend_from_slice(&body);
        push_word(&mut image, FW_IMG_FOOTER_MAGIC);
        push_word(&mut image, crc32fast::hash(&body));
        image
    }

    /// Decode `image` delivered as one whole chunk, returning the collected
    /// (address, payload) block stream and the final checksum words.
    fn decode_whole(
        image: &[u8],
        symbols: &mut [SymbolEntry],
        algs: &mut [u32],
        scratch: &mut [u8],
    ) -> (Vec<(u32, Vec<u8>)>, u32, u32) {
        let mut chunk = image;
        let header = FwImageHeader::read(&mut chunk).unwrap();
        let mut dec = FwImageDecoder::new(
            &header,
            DecodeBuffers {
                symbols,
                alg_ids: algs,
                scratch,
            },
        )
        .unwrap();
        let mut out = Vec::new();
        loop {
            match dec.process(&mut chunk).unwrap() {
                Decode::NeedData => panic!("image exhausted before completion"),
                Decode::BlockReady => {
                    let (address, data) = dec.staged_block().unwrap();
                    out.push((address, data.to_vec()));
                }
                Decode::Complete { checksum } => {
                    return (out, checksum, dec.computed_checksum())
                }
            }
        }
    }

    #[test]
    fn read_header_rejects_bad_magic_without_consuming() {
        let mut image = build_image(&[], &[], &[]);
        image[0] ^= 0xFF;
        let mut chunk = image.as_slice();
        let before = chunk.len();
        assert!(matches!(
            FwImageHeader::read(&mut chunk),
            Err(ImageError::HeaderMagic(_))
        ));
        assert_eq!(chunk.len(), before, "nothing may be consumed on failure");
    }

    #[test]
    fn read_header_rejects_short_first_chunk() {
        let image = build_image(&[], &[], &[]);
        let mut chunk = &image[..FwImageHeader::SIZE - 1];
        assert_eq!(FwImageHeader::read(&mut chunk), Err(ImageError::Truncated));
        let mut empty: &[u8] = &[];
        assert_eq!(FwImageHeader::read(&mut empty), Err(ImageError::Truncated));
    }

    #[test]
    fn whole_image_round_trips_in_one_chunk() {
        let payload_a = [0x11u8; 12];
        let payload_b = [0x22u8; 7];
        let image = build_image(
            &[(0x0001, 0x0280_1000), (0x0004, 0x0280_1004)],
            &[0xAB01, 0xAB02, 0xAB03],
            &[(0x0280_2000, &payload_a), (0x0280_3000, &payload_b)],
        );
        let mut symbols = [SymbolEntry::default(); 2];
        let mut algs = [0u32; 3];
        let mut scratch = [0u8; 16];
        let (blocks, declared, computed) =
            decode_whole(&image, &mut symbols, &mut algs, &mut scratch);

        assert_eq!(symbols[0], SymbolEntry { id: 0x0001, address: 0x0280_1000 });
        assert_eq!(symbols[1], SymbolEntry { id: 0x0004, address: 0x0280_1004 });
        assert_eq!(algs, [0xAB01, 0xAB02, 0xAB03]);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0], (0x0280_2000, payload_a.to_vec()));
        assert_eq!(blocks[1], (0x0280_3000, payload_b.to_vec()));
        assert_eq!(declared, computed);
    }

    #[test]
    fn byte_at_a_time_delivery_decodes_identically() {
        let payload = [0xA5u8; 9];
        let image = build_image(&[(7, 0x0280_0010)], &[42], &[(0x0280_4000, &payload)]);

        let mut header_chunk = &image[..FwImageHeader::SIZE];
        let header = FwImageHeader::read(&mut header_chunk).unwrap();
        let mut symbols = [SymbolEntry::default(); 1];
        let mut algs = [0u32; 1];
        let mut scratch = [0u8; 16];
        let mut dec = FwImageDecoder::new(
            &header,
            DecodeBuffers {
                symbols: &mut symbols,
                alg_ids: &mut algs,
                scratch: &mut scratch,
            },
        )
        .unwrap();

        let mut blocks = Vec::new();
        let mut complete = None;
        for byte in &image[FwImageHeader::SIZE..] {
            let mut chunk = core::slice::from_ref(byte);
            loop {
                match dec.process(&mut chunk).unwrap() {
                    Decode::NeedData => break,
                    Decode::BlockReady => {
                        let (address, data) = dec.staged_block().unwrap();
                        blocks.push((address, data.to_vec()));
                    }
                    Decode::Complete { checksum } => {
                        complete = Some(checksum);
                        break;
                    }
                }
            }
        }
        assert_eq!(blocks, vec![(0x0280_4000, payload.to_vec())]);
        assert_eq!(complete, Some(dec.computed_checksum()));
    }

    #[test]
    fn corrupt_footer_magic_fails_after_good_blocks() {
        let payload = [0x33u8; 4];
        let mut image = build_image(&[], &[], &[(0x0280_0000, &payload)]);
        let footer_at = image.len() - 8;
        image[footer_at] ^= 0x01;

        let mut chunk = image.as_slice();
        let header = FwImageHeader::read(&mut chunk).unwrap();
        let mut symbols: [SymbolEntry; 0] = [];
        let mut algs: [u32; 0] = [];
        let mut scratch = [0u8; 8];
        let mut dec = FwImageDecoder::new(
            &header,
            DecodeBuffers {
                symbols: &mut symbols,
                alg_ids: &mut algs,
                scratch: &mut scratch,
            },
        )
        .unwrap();

        assert_eq!(dec.process(&mut chunk), Ok(Decode::BlockReady));
        assert!(matches!(
            dec.process(&mut chunk),
            Err(ImageError::FooterMagic(_))
        ));
    }

    #[test]
    fn block_larger_than_scratch_fails_immediately() {
        let payload = [0u8; 32];
        let image = build_image(&[], &[], &[(0x0280_0000, &payload)]);
        let mut chunk = image.as_slice();
        let header = FwImageHeader::read(&mut chunk).unwrap();
        let mut symbols: [SymbolEntry; 0] = [];
        let mut algs: [u32; 0] = [];
        let mut scratch = [0u8; 16]; // smaller than the declared 32
        let mut dec = FwImageDecoder::new(
            &header,
            DecodeBuffers {
                symbols: &mut symbols,
                alg_ids: &mut algs,
                scratch: &mut scratch,
            },
        )
        .unwrap();
        assert_eq!(
            dec.process(&mut chunk),
            Err(ImageError::BlockTooLarge { size: 32, capacity: 16 })
        );
    }

    #[test]
    fn undersized_tables_are_rejected_up_front() {
        let image = build_image(&[(1, 2), (3, 4)], &[], &[]);
        let mut chunk = image.as_slice();
        let header = FwImageHeader::read(&mut chunk).unwrap();
        let mut symbols = [SymbolEntry::default(); 1]; // header declares 2
        let mut algs: [u32; 0] = [];
        let mut scratch = [0u8; 4];
        assert!(matches!(
            FwImageDecoder::new(
                &header,
                DecodeBuffers {
                    symbols: &mut symbols,
                    alg_ids: &mut algs,
                    scratch: &mut scratch,
                },
            ),
            Err(ImageError::TableTooSmall)
        ));
    }
}
