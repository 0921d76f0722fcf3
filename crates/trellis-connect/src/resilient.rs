//! Resilient TLS dialing
//!
//! Middleboxes that key on the SNI read the ClientHello as one clean
//! record. This wrapper denies them that: fragment mode re-frames the
//! hello into many records split inside the SNI bytes; reorder mode
//! writes fixed-size slices alternating the socket TTL between zero and
//! native, so the first pass drops mid-path and TCP's retransmits
//! deliver the bytes out of order. The peer's TLS stack reassembles
//! either way.

use std::io;
use std::ops::Range;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tracing::trace;

/// TLS record header length
pub const TLS_RECORD_HEADER_LEN: usize = 5;
/// Handshake content type
pub const CONTENT_TYPE_HANDSHAKE: u8 = 22;
/// ClientHello handshake message type
pub const HANDSHAKE_CLIENT_HELLO: u8 = 1;

/// Reorder slice width in bytes
const REORDER_BLOCK_SIZE: usize = 32;

/// Which obfuscation the wrapper applies to the ClientHello
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResilientMode {
    /// Record fragmentation around the SNI
    Fragment,
    /// TTL-alternating fixed-size slices
    Reorder,
    /// Both combined
    FragmentReorder,
}

/// Length of the complete TLS record at the front of `buf`, if whole
pub fn complete_record_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < TLS_RECORD_HEADER_LEN {
        return None;
    }
    let payload_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    let total = TLS_RECORD_HEADER_LEN + payload_len;
    (buf.len() >= total).then_some(total)
}

struct ByteCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn u8(&mut self) -> Option<u8> {
        let value = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(value)
    }

    fn u16(&mut self) -> Option<u16> {
        let high = self.u8()?;
        let low = self.u8()?;
        Some(u16::from_be_bytes([high, low]))
    }

    fn skip(&mut self, len: usize) -> Option<()> {
        (self.pos + len <= self.buf.len()).then(|| {
            self.pos += len;
        })
    }
}

/// Byte range of the SNI hostname within a ClientHello payload
///
/// `payload` is the handshake message without the record header. The
/// returned range is relative to `payload`.
pub fn client_hello_sni_range(payload: &[u8]) -> Option<Range<usize>> {
    let mut cursor = ByteCursor::new(payload);

    if cursor.u8()? != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    cursor.skip(3)?; // handshake length
    cursor.skip(2)?; // client version
    cursor.skip(32)?; // random
    let session_id_len = cursor.u8()? as usize;
    cursor.skip(session_id_len)?;
    let cipher_suites_len = cursor.u16()? as usize;
    cursor.skip(cipher_suites_len)?;
    let compression_len = cursor.u8()? as usize;
    cursor.skip(compression_len)?;

    let extensions_len = cursor.u16()? as usize;
    let extensions_end = cursor.pos.checked_add(extensions_len)?;
    while cursor.pos < extensions_end.min(payload.len()) {
        let extension_type = cursor.u16()?;
        let extension_len = cursor.u16()? as usize;
        if extension_type != 0 {
            cursor.skip(extension_len)?;
            continue;
        }
        // server_name extension: list length, then one entry
        cursor.u16()?; // server_name_list length
        if cursor.u8()? != 0 {
            return None; // only host_name entries are defined
        }
        let name_len = cursor.u16()? as usize;
        let start = cursor.pos;
        cursor.skip(name_len)?;
        return Some(start..start + name_len);
    }
    None
}

fn record_header(version: [u8; 2], payload_len: usize) -> [u8; 5] {
    let len = payload_len as u16;
    [
        CONTENT_TYPE_HANDSHAKE,
        version[0],
        version[1],
        (len >> 8) as u8,
        len as u8,
    ]
}

/// Re-frame a ClientHello record into several records split inside the
/// SNI byte range
///
/// `record` includes its 5-byte header; `sni` is relative to the
/// payload. Concatenating the returned records' payloads reproduces the
/// original payload exactly.
pub fn fragment_client_hello<R: Rng + ?Sized>(
    record: &[u8],
    sni: Range<usize>,
    rng: &mut R,
) -> Vec<Vec<u8>> {
    let version = [record[1], record[2]];
    let payload = &record[TLS_RECORD_HEADER_LEN..];

    let mut splits = vec![0, sni.start];
    let mut pos = sni.start;
    while pos < sni.end {
        pos = (pos + rng.gen_range(1..=3)).min(sni.end);
        splits.push(pos);
    }
    splits.push(payload.len());
    splits.dedup();

    let mut records = Vec::with_capacity(splits.len());
    for window in splits.windows(2) {
        let part = &payload[window[0]..window[1]];
        if part.is_empty() {
            continue;
        }
        let mut framed = Vec::with_capacity(TLS_RECORD_HEADER_LEN + part.len());
        framed.extend_from_slice(&record_header(version, part.len()));
        framed.extend_from_slice(part);
        records.push(framed);
    }
    records
}

/// Slice raw bytes into fixed-size blocks with alternating TTL marks
///
/// The bool is true for slices written with TTL zero (dropped mid-path
/// and delivered later by TCP retransmission).
pub fn reorder_slices(bytes: &[u8], block_size: usize) -> Vec<(Vec<u8>, bool)> {
    bytes
        .chunks(block_size.max(1))
        .enumerate()
        .map(|(index, chunk)| (chunk.to_vec(), index % 2 == 0))
        .collect()
}

struct OutSegment {
    bytes: Bytes,
    ttl_zero: bool,
}

/// TCP stream wrapper applying ClientHello obfuscation
///
/// Active from construction until [`set_off`](Self::set_off); after the
/// TLS handshake completes the caller switches it off and every write
/// passes straight through.
pub struct ResilientTlsStream {
    tcp: TcpStream,
    mode: ResilientMode,
    active: bool,
    parse_buf: BytesMut,
    out: std::collections::VecDeque<OutSegment>,
    native_ttl: u32,
    current_ttl: u32,
}

impl ResilientTlsStream {
    /// Wrap a connected stream
    pub fn new(tcp: TcpStream, mode: ResilientMode) -> io::Result<Self> {
        // Each segment must leave as its own packet for the TTL and
        // fragmentation games to mean anything.
        tcp.set_nodelay(true)?;
        let native_ttl = tcp.ttl()?;
        Ok(Self {
            tcp,
            mode,
            active: true,
            parse_buf: BytesMut::new(),
            out: std::collections::VecDeque::new(),
            native_ttl,
            current_ttl: native_ttl,
        })
    }

    /// Stop transforming; subsequent writes pass through untouched
    pub fn set_off(&mut self) {
        self.active = false;
        if self.current_ttl != self.native_ttl {
            let _ = self.tcp.set_ttl(self.native_ttl);
            self.current_ttl = self.native_ttl;
        }
    }

    /// Whether the wrapper still transforms writes
    pub fn is_active(&self) -> bool {
        self.active
    }

    fn extract_records(&mut self) {
        while let Some(len) = complete_record_len(&self.parse_buf) {
            let record = self.parse_buf.split_to(len).freeze();
            self.transform_record(record);
        }
    }

    fn transform_record(&mut self, record: Bytes) {
        let is_client_hello = record[0] == CONTENT_TYPE_HANDSHAKE
            && record
                .get(TLS_RECORD_HEADER_LEN)
                .is_some_and(|b| *b == HANDSHAKE_CLIENT_HELLO);
        let sni = is_client_hello
            .then(|| client_hello_sni_range(&record[TLS_RECORD_HEADER_LEN..]))
            .flatten();

        let Some(sni) = sni else {
            self.out.push_back(OutSegment {
                bytes: record,
                ttl_zero: false,
            });
            return;
        };

        let mut rng = rand::thread_rng();
        trace!(mode = ?self.mode, sni_len = sni.len(), "transforming client hello");
        match self.mode {
            ResilientMode::Fragment => {
                for framed in fragment_client_hello(&record, sni, &mut rng) {
                    self.out.push_back(OutSegment {
                        bytes: Bytes::from(framed),
                        ttl_zero: false,
                    });
                }
            }
            ResilientMode::Reorder => {
                for (slice, ttl_zero) in reorder_slices(&record, REORDER_BLOCK_SIZE) {
                    self.out.push_back(OutSegment {
                        bytes: Bytes::from(slice),
                        ttl_zero,
                    });
                }
            }
            ResilientMode::FragmentReorder => {
                for (index, framed) in fragment_client_hello(&record, sni, &mut rng)
                    .into_iter()
                    .enumerate()
                {
                    self.out.push_back(OutSegment {
                        bytes: Bytes::from(framed),
                        ttl_zero: index % 2 == 0,
                    });
                }
            }
        }
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while let Some(front) = self.out.front_mut() {
            let want_ttl = if front.ttl_zero { 0 } else { self.native_ttl };
            if self.current_ttl != want_ttl {
                self.tcp.set_ttl(want_ttl)?;
                self.current_ttl = want_ttl;
            }
            match Pin::new(&mut self.tcp).poll_write(cx, &front.bytes) {
                Poll::Ready(Ok(written)) => {
                    front.bytes.advance(written);
                    if front.bytes.is_empty() {
                        self.out.pop_front();
                    }
                }
                Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                Poll::Pending => return Poll::Pending,
            }
        }
        if self.current_ttl != self.native_ttl {
            self.tcp.set_ttl(self.native_ttl)?;
            self.current_ttl = self.native_ttl;
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for ResilientTlsStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.tcp).poll_read(cx, buf)
    }
}

impl AsyncWrite for ResilientTlsStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if !this.active && this.parse_buf.is_empty() && this.out.is_empty() {
            return Pin::new(&mut this.tcp).poll_write(cx, buf);
        }

        this.parse_buf.extend_from_slice(buf);
        if this.active {
            this.extract_records();
        } else {
            // Switched off with residue: forward whatever is buffered.
            let residue = this.parse_buf.split().freeze();
            this.out.push_back(OutSegment {
                bytes: residue,
                ttl_zero: false,
            });
        }
        // Bytes are accepted into the queue; drain opportunistically.
        let _ = this.poll_drain(cx)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.tcp).poll_flush(cx),
            other => other,
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.tcp).poll_shutdown(cx),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    /// Minimal ClientHello record with one SNI entry.
    fn client_hello_record(host: &str) -> Vec<u8> {
        let mut extension_data = Vec::new();
        extension_data.extend_from_slice(&((host.len() + 3) as u16).to_be_bytes());
        extension_data.push(0); // host_name
        extension_data.extend_from_slice(&(host.len() as u16).to_be_bytes());
        extension_data.extend_from_slice(host.as_bytes());

        let mut extensions = Vec::new();
        extensions.extend_from_slice(&0u16.to_be_bytes()); // server_name type
        extensions.extend_from_slice(&(extension_data.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&extension_data);

        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // client version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session id length
        body.extend_from_slice(&2u16.to_be_bytes()); // cipher suites length
        body.extend_from_slice(&[0x13, 0x01]);
        body.push(1); // compression methods length
        body.push(0);
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = Vec::new();
        handshake.push(HANDSHAKE_CLIENT_HELLO);
        let body_len = body.len() as u32;
        handshake.extend_from_slice(&body_len.to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = Vec::new();
        record.extend_from_slice(&record_header([0x03, 0x01], handshake.len()));
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn test_sni_range_locates_hostname() {
        let record = client_hello_record("concealed.example.com");
        let payload = &record[TLS_RECORD_HEADER_LEN..];

        let range = client_hello_sni_range(payload).unwrap();
        assert_eq!(&payload[range], b"concealed.example.com");
    }

    #[test]
    fn test_sni_range_absent() {
        // A ServerHello-shaped payload has no SNI.
        assert!(client_hello_sni_range(&[0x02, 0, 0, 0]).is_none());
        assert!(client_hello_sni_range(&[]).is_none());
    }

    #[test]
    fn test_complete_record_len() {
        let record = client_hello_record("a.example");
        assert_eq!(complete_record_len(&record), Some(record.len()));
        assert_eq!(complete_record_len(&record[..4]), None);
        assert_eq!(complete_record_len(&record[..record.len() - 1]), None);
    }

    #[test]
    fn test_fragments_reassemble_to_original() {
        let record = client_hello_record("concealed.example.com");
        let payload = record[TLS_RECORD_HEADER_LEN..].to_vec();
        let sni = client_hello_sni_range(&payload).unwrap();

        let mut rng = StdRng::seed_from_u64(11);
        let fragments = fragment_client_hello(&record, sni.clone(), &mut rng);

        // More than one fragment, each a well-formed handshake record,
        // and the payloads concatenate back to the original hello.
        assert!(fragments.len() > 2);
        let mut reassembled = Vec::new();
        for fragment in &fragments {
            assert_eq!(fragment[0], CONTENT_TYPE_HANDSHAKE);
            assert_eq!(
                complete_record_len(fragment),
                Some(fragment.len()),
                "fragment header length mismatch"
            );
            reassembled.extend_from_slice(&fragment[TLS_RECORD_HEADER_LEN..]);
        }
        assert_eq!(reassembled, payload);

        // The SNI itself is split across records.
        let sni_bytes = &payload[sni];
        assert!(fragments
            .iter()
            .all(|f| !f.windows(sni_bytes.len()).any(|w| w == sni_bytes)));
    }

    #[test]
    fn test_reorder_slices_cover_and_alternate() {
        let record = client_hello_record("concealed.example.com");
        let slices = reorder_slices(&record, 32);

        let mut reassembled = Vec::new();
        for (index, (slice, ttl_zero)) in slices.iter().enumerate() {
            assert_eq!(*ttl_zero, index % 2 == 0);
            reassembled.extend_from_slice(slice);
        }
        assert_eq!(reassembled, record);
    }
}
