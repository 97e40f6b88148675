use std::net::TcpListener;
const MAX_PORT: u16 = 65535;

pub fn is_port_available(host: &str, port: u16) -> bool {
    TcpListener::bind((host, port)).is_ok()
}

pub fn find_available_port(host: &str, start_port: u16) -> Option<u16> {
    (start_port..MAX_PORT).find(|&port| is_port_available(host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_occupied_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!is_port_available("127.0.0.1", port));

        let next = find_available_port("127.0.0.1", port).unwrap();
        assert_ne!(next, port);
        assert!(next > port);
    }
}
