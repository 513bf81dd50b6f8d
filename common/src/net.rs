use std::{
    io::{self, ErrorKind, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    time::Duration,
};

pub trait Connection: Read + Write {
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool>;

    fn is_open(&self) -> bool;
}

pub trait Listener {
    type Connection: Connection;

    fn poll_accept(&mut self) -> io::Result<Option<Self::Connection>>;
}

#[derive(Debug)]
pub struct TcpPort {
    listener: TcpListener,
    io_timeout: Duration,
}

impl TcpPort {
    pub fn bind<A: ToSocketAddrs>(addr: A, io_timeout: Duration) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            io_timeout: io_timeout.max(Duration::from_millis(1)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl Listener for TcpPort {
    type Connection = TcpConnection;

    fn poll_accept(&mut self) -> io::Result<Option<TcpConnection>> {
        match self.listener.accept() {
            Ok((stream, _peer)) => TcpConnection::new(stream, self.io_timeout).map(Some),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }
}

#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
    io_timeout: Duration,
    open: bool,
}

impl TcpConnection {
    fn new(stream: TcpStream, io_timeout: Duration) -> io::Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(io_timeout))?;
        stream.set_write_timeout(Some(io_timeout))?;
        let _ = stream.set_nodelay(true);
        Ok(Self {
            stream,
            io_timeout,
            open: true,
        })
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    fn peek_once(&mut self) -> io::Result<bool> {
        let mut probe = [0_u8; 1];
        match self.stream.peek(&mut probe) {
            Ok(0) => {
                self.open = false;
                Ok(false)
            }
            Ok(_) => Ok(true),
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Ok(false)
            }
            Err(err) => {
                self.open = false;
                Err(err)
            }
        }
    }
}

impl Connection for TcpConnection {
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        if !self.open {
            return Ok(false);
        }

        if timeout.is_zero() {
            self.stream.set_nonblocking(true)?;
            let ready = self.peek_once();
            self.stream.set_nonblocking(false)?;
            return ready;
        }

        self.stream.set_read_timeout(Some(timeout))?;
        let ready = self.peek_once();
        self.stream.set_read_timeout(Some(self.io_timeout))?;
        ready
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

impl Read for TcpConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.stream.read(buf);
        match &read {
            Ok(0) if !buf.is_empty() => self.open = false,
            Err(err) if !matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                self.open = false
            }
            _ => {}
        }
        read
    }
}

impl Write for TcpConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf).inspect_err(|_| self.open = false)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}
