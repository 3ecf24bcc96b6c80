use std::net::UdpSocket;

/// Finds a control port whose next port number is also free, the way
/// [`rtpmidid::endpoint::Endpoint::bind`] needs them (§6: control port and
/// control port + 1).
pub fn find_consecutive_ports() -> (u16, u16) {
    loop {
        let socket = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
        let port = socket.local_addr().unwrap().port();
        let next_port = port + 1;
        if let Ok(socket2) = UdpSocket::bind(("127.0.0.1", next_port)) {
            drop(socket);
            drop(socket2);
            return (port, next_port);
        }
    }
}
