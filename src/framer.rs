use std::fmt;
use std::io::{self, Read, Write};
use std::rc::Rc;

use log::*;
use mio::net::TcpStream;
use mio::{Interest, Token};
use zerocopy::{AsBytes, FromBytes};

use crate::codec::{Codec, CompressKind, SqueezeErr, COMPRESS_THRESHOLD};
use crate::proto::{FrameHead, Meta, FRAME_HEAD_LEN, MAX_DATA_LEN, MAX_META_LEN};
use crate::reactor::{EventSink, Reactor};

/// Read side of the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq)]
enum ReadState {
    Read,
    Parse,
    Wait,
    Close,
}

/// Write side of the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq)]
enum WriteState {
    Write,
    Wait,
    Close,
}

pub enum SendStep {
    /// The buffered frame went out completely.
    Done,
    /// Partial write, the socket is full; wait for writability.
    Partial,
    Error,
}

enum FillStatus {
    /// Read something. `budget_hit` means the pass stopped at the realloc
    /// budget, not at EAGAIN, so the socket may still hold bytes.
    Ok { budget_hit: bool },
    Again,
    Error,
}

/// Serialize one frame (meta then data, optionally compressed as a whole)
/// into `out`, which afterwards holds header + body. Returns the meta and
/// data lengths recorded in the header.
///
/// The staging pass writes the flat body into the codec scratch; identity
/// frames are encoded straight into `out`.
pub(crate) fn seal_frame(
    out: &mut Vec<u8>, codec: &mut Codec, kind: CompressKind, meta: &Meta,
    data: Option<&dyn crate::body::Body>,
) -> Result<(usize, usize), ()> {
    out.clear();

    let mut comp = kind;
    let (meta_len, data_len);

    if comp == CompressKind::None {
        out.resize(FRAME_HEAD_LEN, 0);
        meta_len = meta.encode(out)?;
        data_len = match data {
            Some(body) => {
                let before = out.len();
                if !body.encode(out) {
                    return Err(());
                }
                out.len() - before
            }
            None => 0,
        };
    } else {
        let stage = codec.stage_vec();
        meta_len = meta.encode(stage)?;
        data_len = match data {
            Some(body) => {
                let before = stage.len();
                if !body.encode(stage) {
                    return Err(());
                }
                stage.len() - before
            }
            None => 0,
        };

        let flat = meta_len + data_len;
        if flat < COMPRESS_THRESHOLD {
            // small frame, compression skipped; id goes out as none
            comp = CompressKind::None;
            out.resize(FRAME_HEAD_LEN, 0);
            out.extend_from_slice(&codec.staged()[..flat]);
        } else {
            let mut cap = flat + 1024;
            loop {
                out.resize(FRAME_HEAD_LEN + cap, 0);
                let tail = &mut out[FRAME_HEAD_LEN..];
                match Codec::compress(comp, &codec.staged()[..flat], tail) {
                    Ok(n) => {
                        out.truncate(FRAME_HEAD_LEN + n);
                        break;
                    }
                    Err(SqueezeErr::BufferTooSmall) => {
                        cap *= 2;
                        continue;
                    }
                    Err(SqueezeErr::InvalidInput) => {
                        error!("invalid input for compression {:?}", comp);
                        return Err(());
                    }
                }
            }
        }
    }

    if meta_len as u32 > MAX_META_LEN {
        error!("the message meta is too long: {}", meta_len);
        return Err(());
    }
    if data_len as u32 > MAX_DATA_LEN {
        error!("the message data is too long: {}", data_len);
        return Err(());
    }

    let payload = out.len() - FRAME_HEAD_LEN;
    let head = FrameHead::new(payload, data_len, meta_len, comp as u8);
    out[..FRAME_HEAD_LEN].copy_from_slice(head.as_bytes());

    Ok((meta_len, data_len))
}

/// Nonblocking frame transport over one TCP socket.
///
/// Owns the raw stream, its reactor registration and both buffer state
/// machines. The protocol layer above supplies frames to send and consumes
/// frames received; faults are reported through the pump results.
pub struct Framer {
    sock: TcpStream,
    token: Token,
    want_write: bool,

    rstate: ReadState,
    rbuf: Vec<u8>,
    rstart: usize,
    rbytes: usize,
    refill: bool,
    max_rbuf: usize,

    wstate: WriteState,
    wbuf: Vec<u8>,
    wsent: usize,
    loaded: bool,
    max_wbuf: usize,
}

impl fmt::Debug for Framer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "framer tok={} r:{:?} w:{:?}", self.token.0, self.rstate, self.wstate)
    }
}

impl Framer {
    /// Wrap a connected socket and register it. `want_write` arms write
    /// interest from the start (client connections do, fresh server
    /// connections wait for a response to queue up).
    pub fn new(
        sock: TcpStream, reactor: &Reactor, sink: Rc<dyn EventSink>, min_rbuf: usize,
        max_rbuf: usize, min_sbuf: usize, max_sbuf: usize, want_write: bool,
    ) -> io::Result<Framer> {
        let mut sock = sock;
        let interest = if want_write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        let token = reactor.register(&mut sock, interest, sink)?;

        let rsize = min_rbuf.max(FRAME_HEAD_LEN);
        let wsize = min_sbuf.max(FRAME_HEAD_LEN);
        Ok(Framer {
            sock,
            token,
            want_write,
            rstate: ReadState::Read,
            rbuf: vec![0; rsize],
            rstart: 0,
            rbytes: 0,
            refill: false,
            max_rbuf: max_rbuf.max(rsize),
            wstate: WriteState::Write,
            wbuf: Vec::with_capacity(wsize),
            wsent: 0,
            loaded: false,
            max_wbuf: max_sbuf.max(wsize),
        })
    }

    #[inline(always)]
    pub fn loaded(&self) -> bool {
        self.loaded
    }

    pub fn local_addr(&self) -> String {
        match self.sock.local_addr() {
            Ok(a) => a.to_string(),
            Err(_) => String::new(),
        }
    }

    pub fn peer_addr(&self) -> String {
        match self.sock.peer_addr() {
            Ok(a) => a.to_string(),
            Err(_) => String::new(),
        }
    }

    /// Remove the socket from the reactor. Further events for the old token
    /// are discarded by the dispatch loop.
    pub fn detach(&mut self, reactor: &Reactor) {
        reactor.deregister(&mut self.sock, self.token);
        self.rstate = ReadState::Close;
        self.wstate = WriteState::Close;
    }

    /// Transition to read+write interest. The poller swaps the whole
    /// registration; an already writable socket reports readiness again.
    pub fn enable_write(&mut self, reactor: &Reactor) {
        if self.want_write {
            return;
        }
        self.want_write = true;
        if let Err(e) =
            reactor.rearm(&mut self.sock, self.token, Interest::READABLE | Interest::WRITABLE)
        {
            error!("rearm read+write failed: {:?}", e);
        }
    }

    pub fn disable_write(&mut self, reactor: &Reactor) {
        if !self.want_write {
            return;
        }
        self.want_write = false;
        if let Err(e) = reactor.rearm(&mut self.sock, self.token, Interest::READABLE) {
            error!("rearm read-only failed: {:?}", e);
        }
    }

    /*
     * Read from the network as much as we can, growing the buffer on
     * overflow. Before reading, the remaining fragment of an incomplete
     * frame moves to the front of the buffer.
     *
     * To protect us from someone flooding the connection with bogus data
     * eating all available memory, break out and parse what we have after
     * a number of reallocs.
     */
    fn fill(&mut self) -> FillStatus {
        if self.rstart != 0 {
            if self.rbytes > 0 {
                self.rbuf.copy_within(self.rstart..self.rstart + self.rbytes, 0);
            }
            self.rstart = 0;
        }

        let mut num_allocs = 0;
        let mut got = false;
        loop {
            if self.rbytes >= self.rbuf.len() {
                if num_allocs == 4 {
                    return FillStatus::Ok { budget_hit: true };
                }
                num_allocs += 1;
                let nsize = self.rbuf.len() * 2;
                self.rbuf.resize(nsize, 0);
            }

            let avail = self.rbuf.len() - self.rbytes;
            match self.sock.read(&mut self.rbuf[self.rbytes..]) {
                Ok(0) => {
                    return FillStatus::Error;
                }
                Ok(n) => {
                    self.rbytes += n;
                    got = true;
                    if n == avail {
                        continue;
                    }
                    return FillStatus::Ok { budget_hit: false };
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if got {
                        return FillStatus::Ok { budget_hit: false };
                    }
                    return FillStatus::Again;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("recv failed: {:?}", e);
                    return FillStatus::Error;
                }
            }
        }
    }

    /// Consume one complete frame from the buffer if present.
    ///
    /// Ok(true): a frame was handed to the sink. Ok(false): fragment, need
    /// more bytes. Err: protocol violation or sink rejection.
    fn parse_one<F: FnMut(&[u8], usize, usize) -> bool>(
        &mut self, codec: &mut Codec, sink: &mut F,
    ) -> Result<bool, ()> {
        if self.rbytes < FRAME_HEAD_LEN {
            return Ok(false);
        }
        let window = &self.rbuf[self.rstart..self.rstart + self.rbytes];
        let head = FrameHead::read_from_prefix(window).ok_or(())?;
        if !head.check() {
            warn!("oversize frame header {:?}", head);
            return Err(());
        }
        let payload = head.payload.get() as usize;
        let meta_len = head.meta.get() as usize;
        let data_len = head.data.get() as usize;
        if self.rbytes < FRAME_HEAD_LEN + payload {
            return Ok(false);
        }

        let comp = match CompressKind::from_wire(head.comp) {
            Some(c) => c,
            None => {
                warn!("unknown compression id {}", head.comp);
                return Err(());
            }
        };

        let body = &window[FRAME_HEAD_LEN..FRAME_HEAD_LEN + payload];
        let ok;
        if comp == CompressKind::None {
            if payload != meta_len + data_len {
                warn!("corrupt frame header {:?}", head);
                return Err(());
            }
            ok = sink(body, meta_len, data_len);
        } else {
            let expected = meta_len + data_len;
            let stage = codec.stage(expected);
            match Codec::decompress(comp, body, stage) {
                Ok(n) => {
                    if n != expected {
                        warn!("corrupt frame body, {} != {} decoded", expected, n);
                        return Err(());
                    }
                }
                Err(e) => {
                    warn!("corrupt frame body: {:?}", e);
                    return Err(());
                }
            }
            ok = sink(&stage[..expected], meta_len, data_len);
        }

        self.rstart += FRAME_HEAD_LEN + payload;
        self.rbytes -= FRAME_HEAD_LEN + payload;

        if ok {
            Ok(true)
        } else {
            Err(())
        }
    }

    /// Drive the read machine: Read -> Parse -> (Wait | Read), Close
    /// terminal. Each complete frame is delivered to `sink` as
    /// (payload, meta_len, data_len), payload already decompressed.
    pub fn on_readable<F: FnMut(&[u8], usize, usize) -> bool>(
        &mut self, codec: &mut Codec, mut sink: F,
    ) -> Result<(), ()> {
        loop {
            match self.rstate {
                ReadState::Read => match self.fill() {
                    FillStatus::Ok { budget_hit } => {
                        self.refill = budget_hit;
                        self.rstate = ReadState::Parse;
                    }
                    FillStatus::Again => {
                        self.rstate = ReadState::Wait;
                    }
                    FillStatus::Error => {
                        self.rstate = ReadState::Close;
                    }
                },
                ReadState::Parse => match self.parse_one(codec, &mut sink) {
                    Ok(true) => {}
                    Ok(false) => {
                        // fragment; if the fill pass stopped at its realloc
                        // budget the socket may still hold bytes and no new
                        // readiness is coming, so read again
                        if self.refill {
                            self.rstate = ReadState::Read;
                        } else {
                            self.rstate = ReadState::Wait;
                        }
                    }
                    Err(_) => {
                        self.rstate = ReadState::Close;
                    }
                },
                ReadState::Wait => {
                    self.rstate = ReadState::Read;
                    if self.rbytes == 0 && self.rbuf.len() > self.max_rbuf {
                        self.rbuf.truncate(self.max_rbuf);
                        self.rbuf.shrink_to(self.max_rbuf);
                        self.rstart = 0;
                    }
                    return Ok(());
                }
                ReadState::Close => {
                    return Err(());
                }
            }
        }
    }

    /// Stage a new outgoing frame. Only valid when nothing is loaded.
    pub fn start_frame(
        &mut self, codec: &mut Codec, kind: CompressKind, meta: &Meta,
        data: Option<&dyn crate::body::Body>,
    ) -> Result<(), ()> {
        debug_assert!(!self.loaded);
        seal_frame(&mut self.wbuf, codec, kind, meta, data)?;
        self.wsent = 0;
        self.loaded = true;
        Ok(())
    }

    /// Push buffered frame bytes until done or the socket fills up.
    pub fn push_bytes(&mut self) -> SendStep {
        debug_assert!(self.loaded);
        loop {
            match self.sock.write(&self.wbuf[self.wsent..]) {
                Ok(0) => {
                    return SendStep::Partial;
                }
                Ok(n) => {
                    self.wsent += n;
                    if self.wsent == self.wbuf.len() {
                        self.loaded = false;
                        if self.wbuf.capacity() > self.max_wbuf {
                            self.wbuf = Vec::with_capacity(self.max_wbuf);
                        }
                        self.wstate = WriteState::Write;
                        return SendStep::Done;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.wstate = WriteState::Wait;
                    return SendStep::Partial;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("send failed: {:?}", e);
                    self.wstate = WriteState::Close;
                    return SendStep::Error;
                }
            }
        }
    }
}
