//! The obfs4 connection.
//!
//! Wires the handshake, framing, and packet layers into a reliable byte
//! pipe. A connection moves `Init -> {Established, Broken}` and
//! `Established -> {Broken, Closed}`; the handshake entry points are only
//! valid in `Init`, everything else only in `Established`, and any state
//! reaches `Closed` through [`Obfs4Stream::close`].

use std::net::SocketAddr;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, timeout_at, Duration, Instant};

use crate::crypto::drbg::Seed;
use crate::crypto::ntor;
use crate::error::{Error, Result};
use crate::framing::{self, Decoded, Decoder, Encoder};
use crate::handshake::{ClientHandshake, Parse, ServerHandshake, MAX_HANDSHAKE_LENGTH};
use crate::packet::{self, make_packet, Packet, PacketType};
use crate::probdist::WeightedDist;

/// Hard deadline for the client side of the handshake.
pub const CLIENT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Hard deadline for the server side of the handshake.
pub const SERVER_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on the bytes a failed server handshake will drain before
/// closing.
pub const MAX_CLOSE_DELAY_BYTES: usize = framing::MAX_SEGMENT_LENGTH * 5;

/// Upper bound in seconds on the extra delay before a failed server
/// handshake closes.
pub const MAX_CLOSE_DELAY_SECS: u64 = 60;

/// Frame plus packet overhead of a padding packet.
const HEADER_LENGTH: usize = framing::FRAME_OVERHEAD + packet::PACKET_OVERHEAD;

/// How much to read off the network per consume pass.
const CONSUME_READ_SIZE: usize = framing::MAX_SEGMENT_LENGTH * 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConnState {
    Init,
    Established,
    Broken,
    Closed,
}

/// An established (or establishing) obfs4 connection over a reliable
/// stream.
///
/// Generic over the underlying transport so tests can run over in-memory
/// duplex pipes; production code wraps [`tokio::net::TcpStream`].
pub struct Obfs4Stream<S> {
    stream: S,
    state: ConnState,
    is_server: bool,

    len_dist: WeightedDist,
    iat_dist: Option<WeightedDist>,

    encoder: Option<Encoder>,
    decoder: Option<Decoder>,

    recv_buf: BytesMut,
    recv_decoded: BytesMut,

    read_deadline: Option<Instant>,

    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Obfs4Stream<S> {
    pub(crate) fn new(
        stream: S,
        is_server: bool,
        len_dist: WeightedDist,
        iat_dist: Option<WeightedDist>,
    ) -> Self {
        Self {
            stream,
            state: ConnState::Init,
            is_server,
            len_dist,
            iat_dist,
            encoder: None,
            decoder: None,
            recv_buf: BytesMut::new(),
            recv_decoded: BytesMut::new(),
            read_deadline: None,
            local_addr: None,
            peer_addr: None,
        }
    }

    pub(crate) fn set_addrs(&mut self, local: Option<SocketAddr>, peer: Option<SocketAddr>) {
        self.local_addr = local;
        self.peer_addr = peer;
    }

    /// Drive the client handshake to completion.
    pub(crate) async fn client_handshake(&mut self, hs: ClientHandshake) -> Result<()> {
        if self.is_server || self.state != ConnState::Init {
            return Err(Error::InvalidState);
        }

        let result = match timeout(CLIENT_HANDSHAKE_TIMEOUT, self.client_handshake_inner(hs)).await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Io(std::io::ErrorKind::TimedOut.into())),
        };

        match result {
            Ok(()) => {
                self.state = ConnState::Established;
                tracing::debug!("client handshake complete");
                Ok(())
            }
            Err(e) => {
                self.state = ConnState::Broken;
                let _ = self.stream.shutdown().await;
                Err(e)
            }
        }
    }

    async fn client_handshake_inner(&mut self, mut hs: ClientHandshake) -> Result<()> {
        let blob = hs.generate_handshake();
        self.stream.write_all(&blob).await?;
        self.stream.flush().await?;

        // Consume the server handshake.
        loop {
            self.recv_buf.reserve(MAX_HANDSHAKE_LENGTH);
            let n = self.stream.read_buf(&mut self.recv_buf).await?;
            if n == 0 {
                return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }

            match hs.parse_server_handshake(&self.recv_buf)? {
                Parse::NeedMore => continue,
                Parse::Complete(done) => {
                    self.recv_buf.advance(done.consumed);

                    // Use the derived key material to initialize the link
                    // crypto. The client encodes with the first half.
                    let okm = ntor::kdf(&done.key_seed, framing::KEY_MATERIAL_LENGTH * 2);
                    self.encoder = Some(Encoder::new(&okm[..framing::KEY_MATERIAL_LENGTH]));
                    self.decoder = Some(Decoder::new(&okm[framing::KEY_MATERIAL_LENGTH..]));
                    return Ok(());
                }
            }
        }
    }

    /// Drive the server handshake to completion, sending the response with
    /// the inline PRNG seed packet in one write.
    pub(crate) async fn server_handshake(
        &mut self,
        hs: ServerHandshake,
        len_seed: &Seed,
    ) -> Result<()> {
        if !self.is_server || self.state != ConnState::Init {
            return Err(Error::InvalidState);
        }

        let result = match timeout(
            SERVER_HANDSHAKE_TIMEOUT,
            self.server_handshake_inner(hs, len_seed),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::Io(std::io::ErrorKind::TimedOut.into())),
        };

        match result {
            Ok(()) => {
                self.state = ConnState::Established;
                tracing::debug!("server handshake complete");
                Ok(())
            }
            Err(e) => {
                self.state = ConnState::Broken;
                Err(e)
            }
        }
    }

    async fn server_handshake_inner(
        &mut self,
        mut hs: ServerHandshake,
        len_seed: &Seed,
    ) -> Result<()> {
        // Consume the client handshake.
        let done = loop {
            self.recv_buf.reserve(MAX_HANDSHAKE_LENGTH);
            let n = self.stream.read_buf(&mut self.recv_buf).await?;
            if n == 0 {
                return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }

            match hs.parse_client_handshake(&self.recv_buf)? {
                Parse::NeedMore => continue,
                Parse::Complete(done) => {
                    self.recv_buf.clear();
                    break done;
                }
            }
        };

        // Use the derived key material to initialize the link crypto. The
        // server's directions are swapped relative to the client's.
        let okm = ntor::kdf(&done.key_seed, framing::KEY_MATERIAL_LENGTH * 2);
        self.encoder = Some(Encoder::new(&okm[framing::KEY_MATERIAL_LENGTH..]));
        self.decoder = Some(Decoder::new(&okm[..framing::KEY_MATERIAL_LENGTH]));

        // Send the response with the length distribution seed appended as
        // the first packet, so the client can mirror the server's padding
        // behavior from its very first burst.
        let mut buf = hs.generate_handshake();
        let seed_pkt = make_packet(PacketType::PrngSeed, len_seed.as_bytes(), 0);
        let encoder = self.encoder.as_mut().expect("encoder initialized above");
        buf.extend_from_slice(&encoder.encode(&seed_pkt)?);

        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;

        Ok(())
    }

    /// Drain and discard peer data until either the byte budget is spent or
    /// the deadline fires, then close.
    ///
    /// This runs after a failed server handshake so that probes cannot
    /// correlate a rejection with an immediate close; the budgets are drawn
    /// per listener from the bridge's seed.
    pub(crate) async fn close_after_delay(
        &mut self,
        delay_bytes: usize,
        delay_secs: u64,
        start: Instant,
    ) {
        let deadline = start + SERVER_HANDSHAKE_TIMEOUT + Duration::from_secs(delay_secs);

        let mut discarded = 0usize;
        let mut buf = [0u8; framing::MAX_SEGMENT_LENGTH];
        while discarded < delay_bytes {
            match timeout_at(deadline, self.stream.read(&mut buf)).await {
                Ok(Ok(n)) if n > 0 => discarded += n,
                // EOF, read error, or deadline: nothing further to soak up.
                _ => break,
            }
        }

        let _ = self.stream.shutdown().await;
        self.state = ConnState::Closed;
    }

    /// Read decrypted payload into `buf`, returning the byte count (0 on a
    /// clean end of stream).
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.state != ConnState::Established {
            return Err(Error::InvalidState);
        }

        // Not all received data is usable payload (padding, control
        // packets), so consume off the network until some is.
        let mut fatal = None;
        while self.recv_decoded.is_empty() {
            match self.consume_frames().await {
                Ok(0) => break,
                Ok(_) => continue,
                // An expired read deadline leaves the connection usable.
                Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::TimedOut => {
                    return Err(Error::Io(e));
                }
                Err(e) => {
                    self.state = ConnState::Broken;
                    fatal = Some(e);
                    break;
                }
            }
        }

        // Serve already-decoded payload even when the connection just died;
        // the error resurfaces on the next call through the state check.
        if !self.recv_decoded.is_empty() {
            let n = buf.len().min(self.recv_decoded.len());
            buf[..n].copy_from_slice(&self.recv_decoded.split_to(n));
            return Ok(n);
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(0),
        }
    }

    /// One network read followed by decoding every complete frame it
    /// produced. Returns the raw byte count read (0 on end of stream).
    async fn consume_frames(&mut self) -> Result<usize> {
        self.recv_buf.reserve(CONSUME_READ_SIZE);
        let n = match self.read_deadline {
            Some(deadline) => {
                match timeout_at(deadline, self.stream.read_buf(&mut self.recv_buf)).await {
                    Ok(result) => result?,
                    Err(_) => return Err(Error::Io(std::io::ErrorKind::TimedOut.into())),
                }
            }
            None => self.stream.read_buf(&mut self.recv_buf).await?,
        };
        if n == 0 {
            return Ok(0);
        }

        while !self.recv_buf.is_empty() {
            let decoder = self.decoder.as_mut().expect("established connections decode");
            match decoder.decode(&mut self.recv_buf)? {
                Decoded::Again => break,
                Decoded::Frame(plaintext) => self.dispatch_packet(&plaintext)?,
            }
        }

        Ok(n)
    }

    fn dispatch_packet(&mut self, plaintext: &[u8]) -> Result<()> {
        let pkt = Packet::parse(plaintext)?;
        match pkt.packet_type {
            PacketType::Payload => {
                if !pkt.payload.is_empty() {
                    self.recv_decoded.extend_from_slice(pkt.payload);
                }
            }
            PacketType::PrngSeed => {
                // Only the client adopts the peer's distribution; a server
                // ignores seeds to keep the bridge-wide one.
                if !self.is_server && pkt.payload.len() >= packet::SEED_PACKET_PAYLOAD_LENGTH {
                    let seed = Seed::from_bytes(
                        &pkt.payload[..packet::SEED_PACKET_PAYLOAD_LENGTH],
                    )
                    .expect("seed length checked");
                    self.len_dist.reset(&seed);
                    tracing::debug!("regenerated length distribution from peer seed");
                }
            }
            PacketType::Unknown(_) => {
                // Ignore unrecognized packet types.
            }
        }
        Ok(())
    }

    /// Write payload, padding the burst per the length distribution, as one
    /// stream write.
    ///
    /// Short writes are fatal: the encoder's nonce counter has advanced and
    /// cannot be rewound, so a partially written burst can never be
    /// completed coherently.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if self.state != ConnState::Established {
            return Err(Error::InvalidState);
        }

        match self.write_inner(buf).await {
            Ok(n) => Ok(n),
            Err(e) => {
                self.state = ConnState::Broken;
                Err(e)
            }
        }
    }

    async fn write_inner(&mut self, buf: &[u8]) -> Result<usize> {
        // Chop the pending data into maximum sized packets.
        let mut burst = Vec::with_capacity(buf.len() + 2 * framing::MAX_SEGMENT_LENGTH);
        let encoder = self.encoder.as_mut().expect("established connections encode");
        for chunk in buf.chunks(packet::MAX_PACKET_PAYLOAD_LENGTH) {
            let pkt = make_packet(PacketType::Payload, chunk, 0);
            burst.extend_from_slice(&encoder.encode(&pkt)?);
        }

        // Add the length obfuscation padding.
        self.pad_burst(&mut burst)?;

        if self.iat_dist.is_some() {
            // Write segment by segment, sleeping a sampled delay (100 usec
            // resolution) between them.
            let mut offset = 0;
            while offset < burst.len() {
                let end = (offset + framing::MAX_SEGMENT_LENGTH).min(burst.len());
                let delay_units = self
                    .iat_dist
                    .as_ref()
                    .expect("checked above")
                    .sample() as u64;
                self.stream.write_all(&burst[offset..end]).await?;
                self.stream.flush().await?;
                tokio::time::sleep(Duration::from_micros(delay_units * 100)).await;
                offset = end;
            }
        } else {
            self.stream.write_all(&burst).await?;
            self.stream.flush().await?;
        }

        Ok(buf.len())
    }

    /// Append trailing padding packets so the burst's tail length modulo the
    /// segment size follows the seeded distribution rather than the
    /// plaintext size.
    fn pad_burst(&mut self, burst: &mut Vec<u8>) -> Result<()> {
        let tail_len = burst.len() % framing::MAX_SEGMENT_LENGTH;
        let to_pad_to = self.len_dist.sample();

        let pad_len = if to_pad_to >= tail_len {
            to_pad_to - tail_len
        } else {
            (framing::MAX_SEGMENT_LENGTH - tail_len) + to_pad_to
        };

        let encoder = self.encoder.as_mut().expect("established connections encode");
        if pad_len > HEADER_LENGTH {
            let pkt = make_packet(PacketType::Payload, &[], pad_len - HEADER_LENGTH);
            burst.extend_from_slice(&encoder.encode(&pkt)?);
        } else if pad_len > 0 {
            // A pad length at or below the header size cannot be expressed
            // as a single packet; overshoot with a maximum sized one first
            // so the tail still lands on the sampled value.
            let max = make_packet(PacketType::Payload, &[], packet::MAX_PACKET_PADDING_LENGTH);
            burst.extend_from_slice(&encoder.encode(&max)?);
            let tail = make_packet(PacketType::Payload, &[], pad_len);
            burst.extend_from_slice(&encoder.encode(&tail)?);
        }

        Ok(())
    }

    /// Close the connection. Idempotence is an error: closing an already
    /// closed connection fails, but never panics.
    pub async fn close(&mut self) -> Result<()> {
        if self.state == ConnState::Closed {
            return Err(Error::InvalidState);
        }
        self.state = ConnState::Closed;
        self.read_deadline = None;
        let _ = self.stream.shutdown().await;
        Ok(())
    }

    /// Set or clear the deadline for subsequent reads.
    ///
    /// Only valid on an established connection.
    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) -> Result<()> {
        if self.state != ConnState::Established {
            return Err(Error::InvalidState);
        }
        self.read_deadline = deadline;
        Ok(())
    }

    /// Whole-connection deadlines are not supported.
    pub fn set_deadline(&mut self, _deadline: Option<Instant>) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Write deadlines are not supported: a timed-out partial write would
    /// desynchronize the frame codec irrecoverably.
    pub fn set_write_deadline(&mut self, _deadline: Option<Instant>) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// The local address, when the underlying stream is a socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        if self.state == ConnState::Closed {
            return None;
        }
        self.local_addr
    }

    /// The peer address, when the underlying stream is a socket.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        if self.state == ConnState::Closed {
            return None;
        }
        self.peer_addr
    }

    #[cfg(test)]
    pub(crate) fn len_dist(&self) -> &WeightedDist {
        &self.len_dist
    }
}
