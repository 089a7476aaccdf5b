#![cfg(unix)]

use std::{
    io::{Read, Write},
    net::SocketAddr,
    os::unix::io::IntoRawFd,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc, Mutex,
    },
    time::Duration,
};

use bytes::Bytes;
use gantry::{
    exec::TimerDriver,
    mem::{MemoryAllocator, MemoryQuota},
    posix::{
        EventPoller, FdRegistry, Listener, ListenerOptions, Poller, ReadArgs, SocketOps,
        TcpEndpoint, TcpOptions, WriteArgs,
    },
    Code, Status,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

struct Stack {
    ops: SocketOps,
    listener: Listener,
    accepted: mpsc::Receiver<TcpEndpoint>,
    port: u16,
}

fn stack(options: TcpOptions) -> Stack {
    let ops = SocketOps::new(Arc::new(FdRegistry::new(true)));
    let poller: Arc<dyn Poller> = EventPoller::new().unwrap();
    let timer = TimerDriver::new();
    let allocator: Arc<dyn MemoryAllocator> = Arc::new(MemoryQuota::new(64 << 20));
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let listener = Listener::new(
        ops.clone(),
        poller,
        timer,
        allocator,
        ListenerOptions {
            tcp: options,
            ..ListenerOptions::default()
        },
        Arc::new(move |endpoint| {
            let _ = tx.lock().unwrap().send(endpoint);
        }),
    );
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let port = listener.bind(addr).unwrap();
    listener.start().unwrap();
    Stack {
        ops,
        listener,
        accepted: rx,
        port,
    }
}

fn read_all(endpoint: &TcpEndpoint, min: usize) -> Result<Bytes, Status> {
    let (tx, rx) = mpsc::channel();
    match endpoint.read(
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
        ReadArgs {
            min_progress_size: min,
        },
    ) {
        Some(result) => result,
        None => rx.recv_timeout(RECV_TIMEOUT).expect("read timed out"),
    }
}

fn write_all(endpoint: &TcpEndpoint, data: Vec<Bytes>) -> Result<(), Status> {
    let (tx, rx) = mpsc::channel();
    match endpoint.write(
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
        data,
        WriteArgs::default(),
    ) {
        Some(result) => result,
        None => rx.recv_timeout(RECV_TIMEOUT).expect("write timed out"),
    }
}

#[test]
fn accept_echo_roundtrip() {
    let stack = stack(TcpOptions::default());
    let mut client = std::net::TcpStream::connect(("127.0.0.1", stack.port)).unwrap();
    let endpoint = stack.accepted.recv_timeout(RECV_TIMEOUT).unwrap();

    assert_eq!(endpoint.peer_address(), client.local_addr().unwrap());
    assert_eq!(endpoint.local_address().port(), stack.port);

    client.write_all(b"hello gantry").unwrap();
    let data = read_all(&endpoint, 12).unwrap();
    assert_eq!(&data[..], b"hello gantry");

    write_all(&endpoint, vec![Bytes::from_static(b"pong")]).unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"pong");
}

#[test]
fn vectored_write_and_min_progress_read() {
    let stack = stack(TcpOptions::default());
    let mut client = std::net::TcpStream::connect(("127.0.0.1", stack.port)).unwrap();
    let endpoint = stack.accepted.recv_timeout(RECV_TIMEOUT).unwrap();

    write_all(
        &endpoint,
        vec![
            Bytes::from_static(b"iovec"),
            Bytes::from_static(b"_is_"),
            Bytes::from_static(b"good"),
        ],
    )
    .unwrap();
    let mut buf = [0u8; 13];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"iovec_is_good");

    // The read waits until min_progress bytes are buffered even when
    // the client dribbles the payload across segments.
    client.write_all(b"abc").unwrap();
    client.flush().unwrap();
    let handle = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        client.write_all(b"defgh").unwrap();
        client
    });
    let data = read_all(&endpoint, 8).unwrap();
    assert_eq!(&data[..], b"abcdefgh");
    let _client = handle.join().unwrap();
}

#[test]
fn eof_then_unavailable() {
    let stack = stack(TcpOptions::default());
    let client = std::net::TcpStream::connect(("127.0.0.1", stack.port)).unwrap();
    let endpoint = stack.accepted.recv_timeout(RECV_TIMEOUT).unwrap();

    drop(client);
    // EOF first surfaces as a clean empty completion.
    let data = read_all(&endpoint, 1).unwrap();
    assert!(data.is_empty());
    // Further reads report the closed connection.
    let err = read_all(&endpoint, 1).unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
}

#[test]
fn shutdown_is_idempotent_and_releases_fd_once() {
    let stack = stack(TcpOptions::default());
    let _client = std::net::TcpStream::connect(("127.0.0.1", stack.port)).unwrap();
    let endpoint = stack.accepted.recv_timeout(RECV_TIMEOUT).unwrap();

    let releases = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();
    {
        let releases = releases.clone();
        endpoint.maybe_shutdown(Status::unavailable("test shutdown"), move |released| {
            releases.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(released);
        });
    }
    {
        let releases = releases.clone();
        endpoint.maybe_shutdown(Status::unavailable("second shutdown"), move |_| {
            releases.fetch_add(1, Ordering::SeqCst);
        });
    }

    let released = rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    assert!(released >= 0);
    assert_eq!(releases.load(Ordering::SeqCst), 1);
    // Ownership transferred to the callback; close it ourselves.
    unsafe { libc::close(released) };

    // Operations after shutdown fail fast.
    let err = read_all(&endpoint, 1).unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);
    let err = write_all(&endpoint, vec![Bytes::from_static(b"x")]).unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);
}

#[test]
fn bind_after_start_is_rejected() {
    let stack = stack(TcpOptions::default());
    let err = stack
        .listener
        .bind("127.0.0.1:0".parse().unwrap())
        .unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);
}

#[test]
fn external_connection_delivers_pending_data_first() {
    let stack = stack(TcpOptions::default());
    let sys_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = sys_listener.local_addr().unwrap();
    let mut client = std::net::TcpStream::connect(addr).unwrap();
    let (server_side, _) = sys_listener.accept().unwrap();

    let fd = stack.ops.registry().adopt(server_side.into_raw_fd());
    stack
        .listener
        .handle_external_connection(None, fd, Some(Bytes::from_static(b"head")))
        .unwrap();
    let endpoint = stack.accepted.recv_timeout(RECV_TIMEOUT).unwrap();

    // Buffered bytes come out ahead of the socket stream.
    let data = read_all(&endpoint, 4).unwrap();
    assert_eq!(&data[..], b"head");

    client.write_all(b"tail").unwrap();
    let data = read_all(&endpoint, 4).unwrap();
    assert_eq!(&data[..], b"tail");
}

#[test]
fn large_write_with_zerocopy_options_roundtrips() {
    let options = TcpOptions::default().zerocopy(true, 16 * 1024);
    let stack = stack(options);
    let mut client = std::net::TcpStream::connect(("127.0.0.1", stack.port)).unwrap();
    let endpoint = stack.accepted.recv_timeout(RECV_TIMEOUT).unwrap();

    let payload = vec![0x5a_u8; 256 * 1024];
    let reader = std::thread::spawn(move || {
        let mut got = vec![0u8; 256 * 1024];
        client.read_exact(&mut got).unwrap();
        got
    });
    write_all(&endpoint, vec![Bytes::from(payload.clone())]).unwrap();
    let got = reader.join().unwrap();
    assert_eq!(got, payload);

    // Shutdown must wait for any in-flight zerocopy acknowledgements
    // before releasing the fd.
    let (tx, rx) = mpsc::channel();
    endpoint.maybe_shutdown(Status::unavailable("done"), move |released| {
        let _ = tx.send(released);
    });
    let released = rx.recv_timeout(RECV_TIMEOUT).unwrap().unwrap();
    unsafe { libc::close(released) };
}
