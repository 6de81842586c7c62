//! Request framing.
//!
//! Every packet is `[0xCE, u32 BE length][header map][body map]`. The
//! length is not known until the maps are written, so the encoder
//! appends a zeroed preheader, encodes, then patches the length back
//! in through the buffer.

use std::convert::TryInto;
use std::io::Write;

use crate::buffer::Buffer;
use crate::error::Error;

use super::api::Request;
use super::codec::{self, IProtoType};
use super::greeting::Greeting;
use super::SyncIndex;

/// Size in bytes of the msgpack-uint32 packet length prefix.
pub const PREHEADER_SIZE: usize = 5;

/// Frames typed requests into a caller-owned [`Buffer`].
///
/// Sync values are strictly monotonic within one encoder: each
/// request gets the next one and the caller correlates responses by
/// it. The buffer is not owned: one buffer may accumulate packets
/// from many `encode` calls before the transport drains it.
#[derive(Debug, Default)]
pub struct RequestEncoder {
    sync: SyncIndex,
}

impl RequestEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last sync handed out.
    #[inline]
    pub fn sync(&self) -> SyncIndex {
        self.sync
    }

    /// Frame one request. Returns the sync assigned to it and the
    /// total packet size (preheader included). On error the buffer is
    /// rolled back to where the packet would have started.
    pub fn encode<R: Request>(
        &mut self,
        buf: &mut Buffer,
        request: &R,
    ) -> Result<(SyncIndex, usize), Error> {
        let sync = self.sync.next();
        let size = self
            .frame(buf, |buf| {
                codec::encode_header(buf, sync, R::TYPE)?;
                request.encode_body(buf)
            })
            .map_err(|e| {
                self.sync.revert();
                e
            })?;
        Ok((sync, size))
    }

    /// Frame an AUTH packet computed against `greeting`'s salt.
    ///
    /// The header carries the request type only: with no sync in the
    /// packet its length depends on nothing but the user name, which
    /// is what makes [`reencode_auth`](Self::reencode_auth) an
    /// in-place patch. The auth response is correlated by protocol
    /// state instead.
    pub fn encode_auth(
        &mut self,
        buf: &mut Buffer,
        user: &str,
        password: &str,
        greeting: &Greeting,
    ) -> Result<usize, Error> {
        self.frame(buf, |buf| {
            encode_auth_packet(buf, user, password, greeting)
        })
    }

    /// Overwrite an AUTH packet previously placed at `start` with a
    /// scramble against a fresh greeting, without growing the buffer.
    pub fn reencode_auth(
        &mut self,
        buf: &mut Buffer,
        start: u64,
        user: &str,
        password: &str,
        greeting: &Greeting,
    ) -> Result<(), Error> {
        let mut packet = Vec::new();
        encode_auth_packet(&mut packet, user, password, greeting)?;

        let old_size = u32::from_be_bytes(
            buf.slice(start + 1, start + PREHEADER_SIZE as u64)
                .try_into()
                .expect("preheader length word is 4 bytes"),
        );
        debug_assert_eq!(old_size as usize, packet.len());
        buf.patch_slice(start + PREHEADER_SIZE as u64, &packet);
        Ok(())
    }

    fn frame(
        &mut self,
        buf: &mut Buffer,
        payload: impl FnOnce(&mut Buffer) -> Result<(), Error>,
    ) -> Result<usize, Error> {
        let start = buf.end();
        buf.write_u8(0xCE);
        buf.write_u32_be(0);
        if let Err(e) = payload(buf) {
            buf.truncate_to(start);
            return Err(e);
        }
        let size = (buf.end() - start) as usize - PREHEADER_SIZE;
        buf.set_u32_be(start + 1, size as u32);
        Ok(size + PREHEADER_SIZE)
    }
}

fn encode_auth_packet(
    out: &mut impl Write,
    user: &str,
    password: &str,
    greeting: &Greeting,
) -> Result<(), Error> {
    rmp::encode::write_map_len(out, 1)?;
    rmp::encode::write_pfix(out, codec::REQUEST_TYPE)?;
    rmp::encode::write_pfix(out, IProtoType::Auth as u8)?;
    codec::encode_auth(out, user, password, greeting.salt())
}
