//! # Setpoint channel
//!
//! The persistent connection to the robot controller. The follower writes one
//! [`SetpointRecord`] per control tick and reads back exactly one acknowledgement.
//!
//! The controller connects to us (the "reverse" connection), so a [`ControllerListener`] accepts
//! connections and performs the handshake, yielding a [`SetpointChannel`]. Both are traits so the
//! follower can be driven by an in-memory controller in tests.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use log::{debug, info};
use std::{
    io::{self, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    thread,
    time::{Duration, Instant},
};

use comms_if::rt::{
    Hello, HelloAck, ProtocolVersion, RobotTelemetry, RtError, SetpointRecord, NUM_JOINTS,
};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// How often a nonblocking accept is retried.
const ACCEPT_POLL_PERIOD: Duration = Duration::from_millis(5);

/// Time allowed for the controller to send its hello.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Shortest read timeout, a zero timeout is rejected by the OS.
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

/// A connected controller.
pub trait SetpointChannel: Send {
    /// Protocol version negotiated at handshake.
    fn protocol_version(&self) -> ProtocolVersion;

    /// Write one setpoint record.
    fn send_setpoint(&mut self, record: &SetpointRecord) -> Result<(), ChannelError>;

    /// Block for the next acknowledgement, for at most `timeout`.
    fn recv_ack(&mut self, timeout: Duration) -> Result<RobotTelemetry, ChannelError>;
}

/// Accepts controller connections.
pub trait ControllerListener: Send {
    /// Wait up to `timeout` for a controller to connect and complete the handshake.
    ///
    /// Returns `Ok(None)` if no controller connected in time.
    fn accept(&mut self, timeout: Duration)
        -> Result<Option<Box<dyn SetpointChannel>>, ChannelError>;
}

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Listens for the controller's reverse connection over TCP.
pub struct TcpControllerListener {
    listener: TcpListener,
}

/// A controller connected over TCP.
pub struct TcpSetpointChannel {
    stream: TcpStream,
    version: ProtocolVersion,
    tx_buf: Vec<u8>,
    rx_buf: Vec<u8>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("I/O error on the setpoint channel: {0}")]
    Io(io::Error),

    #[error("No acknowledgement from the controller within the timeout")]
    Timeout,

    #[error("The controller closed the connection")]
    Closed,

    #[error("Handshake with the controller failed: {0}")]
    Handshake(#[source] RtError),

    #[error("Invalid record on the setpoint channel: {0}")]
    Rt(#[from] RtError),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl TcpControllerListener {
    /// Bind the listener to the given address and port.
    pub fn bind(ip: &str, port: u16) -> io::Result<Self> {
        let listener = TcpListener::bind((ip, port))?;
        listener.set_nonblocking(true)?;

        info!("Listening for the controller on {}", listener.local_addr()?);

        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn handshake(&self, mut stream: TcpStream) -> Result<TcpSetpointChannel, ChannelError> {
        stream.set_nonblocking(false).map_err(ChannelError::Io)?;
        stream.set_nodelay(true).map_err(ChannelError::Io)?;
        stream
            .set_read_timeout(Some(HANDSHAKE_TIMEOUT))
            .map_err(ChannelError::Io)?;
        stream
            .set_write_timeout(Some(HANDSHAKE_TIMEOUT))
            .map_err(ChannelError::Io)?;

        let hello = Hello::read_from(&mut stream).map_err(ChannelError::Handshake)?;

        let mut buf = Vec::with_capacity(HelloAck::LEN);
        HelloAck {
            num_joints: NUM_JOINTS as u8,
        }
        .write_to(&mut buf)
        .map_err(ChannelError::Handshake)?;
        stream.write_all(&buf).map_err(map_io_error)?;

        let version = hello.protocol_version();
        info!(
            "Controller handshake complete, version {}.{} ({:?} acknowledgements)",
            hello.major, hello.minor, version
        );

        Ok(TcpSetpointChannel {
            stream,
            version,
            tx_buf: Vec::with_capacity(SetpointRecord::LEN),
            rx_buf: vec![0; version.ack_len()],
        })
    }
}

impl ControllerListener for TcpControllerListener {
    fn accept(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Box<dyn SetpointChannel>>, ChannelError> {
        let deadline = Instant::now() + timeout;

        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    info!("Controller connected from {}", addr);
                    return self
                        .handshake(stream)
                        .map(|c| Some(Box::new(c) as Box<dyn SetpointChannel>));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    thread::sleep(ACCEPT_POLL_PERIOD.min(deadline - now));
                }
                Err(e) => return Err(ChannelError::Io(e)),
            }
        }
    }
}

impl SetpointChannel for TcpSetpointChannel {
    fn protocol_version(&self) -> ProtocolVersion {
        self.version
    }

    fn send_setpoint(&mut self, record: &SetpointRecord) -> Result<(), ChannelError> {
        self.tx_buf.clear();
        record.encode(&mut self.tx_buf)?;
        self.stream.write_all(&self.tx_buf).map_err(map_io_error)
    }

    fn recv_ack(&mut self, timeout: Duration) -> Result<RobotTelemetry, ChannelError> {
        self.stream
            .set_read_timeout(Some(timeout.max(MIN_READ_TIMEOUT)))
            .map_err(ChannelError::Io)?;

        self.stream
            .read_exact(&mut self.rx_buf)
            .map_err(map_io_error)?;

        Ok(RobotTelemetry::decode(self.version, &self.rx_buf)?)
    }
}

impl Drop for TcpSetpointChannel {
    fn drop(&mut self) {
        debug!("Closing the controller connection");
        self.stream.shutdown(std::net::Shutdown::Both).ok();
    }
}

// ------------------------------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn map_io_error(e: io::Error) -> ChannelError {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ChannelError::Timeout,
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => ChannelError::Closed,
        _ => ChannelError::Io(e),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use comms_if::rt::{AckV1, SetpointKind};

    /// Connect as a controller and complete the handshake.
    fn connect(addr: SocketAddr, major: u8) -> TcpStream {
        let mut stream = TcpStream::connect(addr).unwrap();
        Hello { major, minor: 0 }.write_to(&mut stream).unwrap();
        let ack = HelloAck::read_from(&mut stream).unwrap();
        assert_eq!(ack.num_joints as usize, NUM_JOINTS);
        stream
    }

    #[test]
    fn test_setpoint_and_ack() {
        let mut listener = TcpControllerListener::bind("127.0.0.1", 0).unwrap();
        let addr = listener.local_addr().unwrap();

        let controller = thread::spawn(move || {
            let mut stream = connect(addr, 1);

            let mut buf = vec![0; SetpointRecord::LEN];
            stream.read_exact(&mut buf).unwrap();
            let record = SetpointRecord::decode(&buf).unwrap();

            let mut ack = Vec::new();
            RobotTelemetry::V1(AckV1 {
                robot_mode: 0,
                q_actual: record.positions,
                qd_actual: [0.0; NUM_JOINTS],
            })
            .encode(&mut ack)
            .unwrap();
            stream.write_all(&ack).unwrap();

            record
        });

        let mut channel = listener
            .accept(Duration::from_secs(5))
            .unwrap()
            .expect("Controller did not connect");
        assert_eq!(channel.protocol_version(), ProtocolVersion::V1);

        channel
            .send_setpoint(&SetpointRecord::idle([0.25; NUM_JOINTS]))
            .unwrap();
        let telemetry = channel.recv_ack(Duration::from_secs(1)).unwrap();

        assert_eq!(telemetry.q_actual(), &[0.25; NUM_JOINTS]);
        assert_eq!(controller.join().unwrap().kind, SetpointKind::Idle);
    }

    #[test]
    fn test_silent_controller_times_out() {
        let mut listener = TcpControllerListener::bind("127.0.0.1", 0).unwrap();
        let addr = listener.local_addr().unwrap();

        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let controller = thread::spawn(move || {
            let _stream = connect(addr, 3);
            done_rx.recv().ok();
        });

        let mut channel = listener.accept(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(channel.protocol_version(), ProtocolVersion::V3);

        channel
            .send_setpoint(&SetpointRecord::idle([0.0; NUM_JOINTS]))
            .unwrap();
        assert!(matches!(
            channel.recv_ack(Duration::from_millis(20)),
            Err(ChannelError::Timeout)
        ));

        done_tx.send(()).unwrap();
        controller.join().unwrap();
    }

    #[test]
    fn test_accept_times_out() {
        let mut listener = TcpControllerListener::bind("127.0.0.1", 0).unwrap();
        assert!(listener
            .accept(Duration::from_millis(20))
            .unwrap()
            .is_none());
    }
}
