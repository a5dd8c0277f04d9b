use crate::anp::{self, Header, Msg, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use crate::error::{Error, NetError, NetResult};
use crate::net::selector::Selector;
use mio::event::Evented;
use mio::Token;
use std::io::{self, Read, Write};
use std::mem;

enum RecvState {
    NoMsg,
    Hdr { buf: [u8; HEADER_SIZE], filled: usize },
    Payload { header: Header, buf: Vec<u8>, filled: usize },
    Received(Msg),
}

enum SendState {
    NoPacket,
    Sending { buf: Vec<u8>, written: usize },
}

/// Per-socket transport state machine.
///
/// Feeds bytes to and from the codec using partial non-blocking I/O. At most
/// one message is in flight in each direction; the two directions progress
/// independently and may both advance on the same turn.
pub struct Transport {
    recv: RecvState,
    send: SendState,
}

impl Transport {
    #[inline]
    pub fn new() -> Transport {
        Transport {
            recv: RecvState::NoMsg,
            send: SendState::NoPacket,
        }
    }

    /// True from `begin_recv` until the received message is taken.
    #[inline]
    pub fn is_receiving(&self) -> bool {
        !matches!(self.recv, RecvState::NoMsg)
    }

    /// True once a complete message is parked and ready to be taken.
    #[inline]
    pub fn done_receiving(&self) -> bool {
        matches!(self.recv, RecvState::Received(_))
    }

    #[inline]
    pub fn is_sending(&self) -> bool {
        matches!(self.send, SendState::Sending { .. })
    }

    /// Arms the receive side for the next message.
    pub fn begin_recv(&mut self) {
        assert!(
            matches!(self.recv, RecvState::NoMsg),
            "Attempted to begin a receive while one is in progress"
        );

        self.recv = RecvState::Hdr {
            buf: [0; HEADER_SIZE],
            filled: 0,
        };
    }

    /// Parks an encoded message in the send slot.
    pub fn send_message(&mut self, msg: &Msg) {
        assert!(
            !self.is_sending(),
            "Attempted to send while a message is in flight"
        );

        self.send = SendState::Sending {
            buf: msg.encode(true),
            written: 0,
        };
    }

    /// Takes the completed message off the receive side.
    pub fn take_received(&mut self) -> Msg {
        match mem::replace(&mut self.recv, RecvState::NoMsg) {
            RecvState::Received(msg) => msg,
            state => {
                self.recv = state;
                panic!("Attempted to take a message before receive completed");
            }
        }
    }

    /// Declares this turn's selector interest: read while a receive is in
    /// progress, write while a send is in flight.
    pub fn update_selector(
        &self,
        sel: &mut Selector,
        handle: &dyn Evented,
        token: Token,
    ) -> io::Result<()> {
        if self.is_receiving() && !self.done_receiving() {
            sel.add_read(handle, token)?;
        }

        if self.is_sending() {
            sel.add_write(handle, token)?;
        }

        Ok(())
    }

    /// Advances both directions as far as the socket allows. Returns on
    /// would-block or when a full message has been received; fatal errors
    /// (lost connection, framing violations) propagate to the caller.
    pub fn do_transfer<S: Read + Write>(&mut self, stream: &mut S) -> Result<(), Error> {
        self.drive_recv(stream)?;
        self.drive_send(stream)?;
        Ok(())
    }

    fn drive_recv<S: Read>(&mut self, stream: &mut S) -> Result<(), Error> {
        loop {
            match mem::replace(&mut self.recv, RecvState::NoMsg) {
                RecvState::Hdr { mut buf, mut filled } => {
                    match read_chunk(stream, &mut buf[filled..]) {
                        Ok(count) => {
                            filled += count;

                            if filled < HEADER_SIZE {
                                self.recv = RecvState::Hdr { buf, filled };
                                continue;
                            }

                            let header = Header::parse(&buf)?;

                            if header.payload_size > MAX_PAYLOAD_SIZE {
                                return Err(Error::eanp_conn(format!(
                                    "payload size {} exceeds the {} byte cap",
                                    header.payload_size, MAX_PAYLOAD_SIZE
                                )));
                            }

                            if header.payload_size == 0 {
                                self.recv =
                                    RecvState::Received(Msg::from_parts(header, Vec::new()));
                                return Ok(());
                            }

                            self.recv = RecvState::Payload {
                                header,
                                buf: vec![0u8; header.payload_size as usize],
                                filled: 0,
                            };
                        }
                        Err(NetError::Wait) => {
                            self.recv = RecvState::Hdr { buf, filled };
                            return Ok(());
                        }
                        Err(NetError::Fatal(err)) => return Err(err),
                    }
                }
                RecvState::Payload {
                    header,
                    mut buf,
                    mut filled,
                } => match read_chunk(stream, &mut buf[filled..]) {
                    Ok(count) => {
                        filled += count;

                        if filled < buf.len() {
                            self.recv = RecvState::Payload {
                                header,
                                buf,
                                filled,
                            };
                            continue;
                        }

                        let elements = anp::parse_payload(&buf)?;
                        self.recv = RecvState::Received(Msg::from_parts(header, elements));
                        return Ok(());
                    }
                    Err(NetError::Wait) => {
                        self.recv = RecvState::Payload {
                            header,
                            buf,
                            filled,
                        };
                        return Ok(());
                    }
                    Err(NetError::Fatal(err)) => return Err(err),
                },
                state => {
                    self.recv = state;
                    return Ok(());
                }
            }
        }
    }

    fn drive_send<S: Write>(&mut self, stream: &mut S) -> Result<(), Error> {
        loop {
            match mem::replace(&mut self.send, SendState::NoPacket) {
                SendState::Sending { buf, mut written } => {
                    match write_chunk(stream, &buf[written..]) {
                        Ok(count) => {
                            written += count;

                            if written < buf.len() {
                                self.send = SendState::Sending { buf, written };
                                continue;
                            }

                            return Ok(());
                        }
                        Err(NetError::Wait) => {
                            self.send = SendState::Sending { buf, written };
                            return Ok(());
                        }
                        Err(NetError::Fatal(err)) => return Err(err),
                    }
                }
                SendState::NoPacket => return Ok(()),
            }
        }
    }
}

fn read_chunk<S: Read>(stream: &mut S, buf: &mut [u8]) -> NetResult<usize> {
    match stream.read(buf) {
        Ok(0) => Err(NetError::Fatal(Error::eanp_conn(
            "connection closed by peer",
        ))),
        Ok(count) => Ok(count),
        Err(err) => Err(err.into()),
    }
}

fn write_chunk<S: Write>(stream: &mut S, buf: &[u8]) -> NetResult<usize> {
    match stream.write(buf) {
        Ok(0) => Err(NetError::Fatal(Error::eanp_conn("zero-length write"))),
        Ok(count) => Ok(count),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anp::{make_type, Element, ROLE_CMD};
    use byteorder::{BigEndian, WriteBytesExt};
    use std::cmp::min;

    /// Socket stand-in delivering data in fixed-size chunks and signalling
    /// would-block when drained or full.
    struct MockChannel {
        input: Vec<u8>,
        cursor: usize,
        output: Vec<u8>,
        chunk: usize,
        max_output: usize,
        eof: bool,
    }

    impl MockChannel {
        fn new(input: Vec<u8>, chunk: usize) -> MockChannel {
            MockChannel {
                input,
                cursor: 0,
                output: Vec::new(),
                chunk,
                max_output: usize::MAX,
                eof: false,
            }
        }
    }

    impl Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.input.len() {
                if self.eof {
                    return Ok(0);
                }
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(min(self.chunk, buf.len()), self.input.len() - self.cursor);
            buf[..count].copy_from_slice(&self.input[self.cursor..self.cursor + count]);
            self.cursor += count;
            Ok(count)
        }
    }

    impl Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.output.len() >= self.max_output {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(self.chunk, buf.len());
            self.output.extend_from_slice(&buf[..count]);
            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn sample_msg() -> Msg {
        Msg::new(make_type(ROLE_CMD, 100), 9)
            .with(Element::U32(1))
            .with(Element::text("ping"))
    }

    #[test]
    fn test_receive_in_small_chunks() {
        let msg = sample_msg();
        let mut mock = MockChannel::new(msg.encode(true), 3);
        let mut transport = Transport::new();

        transport.begin_recv();

        while !transport.done_receiving() {
            transport.do_transfer(&mut mock).unwrap();
        }

        assert_eq!(transport.take_received(), msg);
        assert!(!transport.is_receiving());
    }

    #[test]
    fn test_receive_zero_payload() {
        let msg = Msg::new(make_type(ROLE_CMD, 1), 4);
        let mut mock = MockChannel::new(msg.encode(true), 64);
        let mut transport = Transport::new();

        transport.begin_recv();
        transport.do_transfer(&mut mock).unwrap();

        assert!(transport.done_receiving());
        assert_eq!(transport.take_received(), msg);
    }

    #[test]
    fn test_receive_stops_at_message_boundary() {
        let first = sample_msg();
        let second = Msg::new(make_type(ROLE_CMD, 100), 10).with(Element::U64(5));

        let mut bytes = first.encode(true);
        bytes.extend(second.encode(true));

        let mut mock = MockChannel::new(bytes, 1024);
        let mut transport = Transport::new();

        transport.begin_recv();
        transport.do_transfer(&mut mock).unwrap();

        assert_eq!(transport.take_received(), first);

        transport.begin_recv();
        transport.do_transfer(&mut mock).unwrap();

        assert_eq!(transport.take_received(), second);
    }

    #[test]
    fn test_receive_err_connection_closed() {
        let mut mock = MockChannel::new(Vec::new(), 16);
        mock.eof = true;

        let mut transport = Transport::new();
        transport.begin_recv();

        let err = transport.do_transfer(&mut mock).unwrap_err();

        assert!(err.message.contains("closed by peer"));
    }

    #[test]
    fn test_receive_err_oversize_payload() {
        let mut header = Vec::new();
        header.write_u32::<BigEndian>(1).unwrap();
        header.write_u32::<BigEndian>(0).unwrap();
        header.write_u32::<BigEndian>(make_type(ROLE_CMD, 1)).unwrap();
        header.write_u64::<BigEndian>(1).unwrap();
        header.write_u32::<BigEndian>(MAX_PAYLOAD_SIZE + 1).unwrap();

        let mut mock = MockChannel::new(header, 64);
        let mut transport = Transport::new();

        transport.begin_recv();

        let err = transport.do_transfer(&mut mock).unwrap_err();

        assert!(err.message.contains("exceeds"));
    }

    #[test]
    fn test_receive_err_malformed_payload() {
        let mut bytes = Vec::new();
        bytes.write_u32::<BigEndian>(1).unwrap();
        bytes.write_u32::<BigEndian>(0).unwrap();
        bytes.write_u32::<BigEndian>(make_type(ROLE_CMD, 1)).unwrap();
        bytes.write_u64::<BigEndian>(1).unwrap();
        bytes.write_u32::<BigEndian>(2).unwrap();
        // Two payload bytes claiming an u32 element: truncated mid-element.
        bytes.push(crate::anp::element::TAG_U32);
        bytes.push(0);

        let mut mock = MockChannel::new(bytes, 64);
        let mut transport = Transport::new();

        transport.begin_recv();

        let err = transport.do_transfer(&mut mock).unwrap_err();

        assert!(err.message.contains("malformed payload"));
    }

    #[test]
    fn test_send_in_small_chunks() {
        let msg = sample_msg();
        let mut mock = MockChannel::new(Vec::new(), 5);
        let mut transport = Transport::new();

        transport.send_message(&msg);
        assert!(transport.is_sending());

        transport.do_transfer(&mut mock).unwrap();

        assert!(!transport.is_sending());
        assert_eq!(mock.output, msg.encode(true));
    }

    #[test]
    fn test_send_resumes_after_would_block() {
        let msg = sample_msg();
        let encoded = msg.encode(true);

        let mut mock = MockChannel::new(Vec::new(), 8);
        mock.max_output = 8;

        let mut transport = Transport::new();
        transport.send_message(&msg);
        transport.do_transfer(&mut mock).unwrap();

        assert!(transport.is_sending());
        assert_eq!(mock.output.len(), 8);

        mock.max_output = usize::MAX;
        transport.do_transfer(&mut mock).unwrap();

        assert!(!transport.is_sending());
        assert_eq!(mock.output, encoded);
    }

    #[test]
    fn test_both_directions_same_turn() {
        let inbound = Msg::new(make_type(ROLE_CMD, 2), 7).with(Element::U32(1));
        let outbound = Msg::new(make_type(ROLE_CMD, 3), 8).with(Element::U64(2));

        let mut mock = MockChannel::new(inbound.encode(true), 1024);
        let mut transport = Transport::new();

        transport.begin_recv();
        transport.send_message(&outbound);
        transport.do_transfer(&mut mock).unwrap();

        assert_eq!(transport.take_received(), inbound);
        assert!(!transport.is_sending());
        assert_eq!(mock.output, outbound.encode(true));
    }

    #[test]
    #[should_panic(expected = "Attempted to begin a receive while one is in progress")]
    fn test_begin_recv_twice_panics() {
        let mut transport = Transport::new();

        transport.begin_recv();
        transport.begin_recv();
    }

    #[test]
    #[should_panic(expected = "Attempted to send while a message is in flight")]
    fn test_send_while_sending_panics() {
        let msg = sample_msg();
        let mut transport = Transport::new();

        transport.send_message(&msg);
        transport.send_message(&msg);
    }
}
