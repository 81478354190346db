//! COLO proxy control channel: a small netlink-like RPC the toolstack
//! uses to drive the in-kernel (or, here, pluggable) colo-proxy module
//! that compares primary/secondary packet streams. Grounded on
//! `libxl_colo_proxy.c`.
use async_trait::async_trait;

use shared::Error;

#[async_trait]
pub trait ColoProxyClient: Send + Sync {
    async fn init(&mut self) -> Result<(), Error>;
    async fn preresume_checkpoint(&mut self) -> Result<(), Error>;

    /// Non-blocking poll: `Ok(true)` if the proxy has decided this pass
    /// should take a checkpoint, `Ok(false)` if it timed out with nothing
    /// to report (not an error — the C source treats a recv timeout as
    /// "no checkpoint" rather than failure).
    async fn query_checkpoint(&mut self) -> Result<bool, Error>;

    async fn failover(&mut self) -> Result<(), Error>;
    async fn teardown(&mut self);
}

/// In-memory fake: a checkpoint is due whenever the test sets
/// `checkpoint_due`, modeling the kernel module's own decision without a
/// real netlink socket.
#[derive(Default)]
pub struct FakeColoProxy {
    pub checkpoint_due: bool,
    pub initialized: bool,
    pub failed_over: bool,
}

#[async_trait]
impl ColoProxyClient for FakeColoProxy {
    async fn init(&mut self) -> Result<(), Error> {
        self.initialized = true;
        Ok(())
    }

    async fn preresume_checkpoint(&mut self) -> Result<(), Error> {
        Ok(())
    }

    async fn query_checkpoint(&mut self) -> Result<bool, Error> {
        Ok(std::mem::take(&mut self.checkpoint_due))
    }

    async fn failover(&mut self) -> Result<(), Error> {
        self.failed_over = true;
        Ok(())
    }

    async fn teardown(&mut self) {
        self.initialized = false;
    }
}

#[cfg(feature = "netlink-colo")]
pub mod netlink {
    use super::*;
    use std::io;
    use std::os::fd::RawFd;
    use std::time::Duration;

    const NETLINK_COLO: i32 = 28;
    const NLMSG_MIN_TYPE: u16 = 0x10;
    const COLO_QUERY_CHECKPOINT: u16 = NLMSG_MIN_TYPE + 1;
    const COLO_CHECKPOINT: u16 = NLMSG_MIN_TYPE + 2;
    const COLO_FAILOVER: u16 = NLMSG_MIN_TYPE + 3;
    const COLO_PROXY_INIT: u16 = NLMSG_MIN_TYPE + 4;

    const NLMSG_ERROR: u16 = 2;

    /// A real `AF_NETLINK` colo-proxy client. Bind index selection and
    /// the 500ms non-blocking-recv timeout for `QUERY_CHECKPOINT`
    /// replicate `colo_proxy_setup`/`colo_proxy_checkpoint` exactly.
    pub struct NetlinkColoProxy {
        sock_fd: RawFd,
        index: u32,
    }

    impl NetlinkColoProxy {
        fn send_raw(&self, msg_type: u16, ack: bool) -> io::Result<()> {
            #[repr(C)]
            struct NlMsgHdr {
                nlmsg_len: u32,
                nlmsg_type: u16,
                nlmsg_flags: u16,
                nlmsg_seq: u32,
                nlmsg_pid: u32,
            }
            const NLM_F_REQUEST: u16 = 1;
            const NLM_F_ACK: u16 = 4;

            let mut flags = NLM_F_REQUEST;
            if ack {
                flags |= NLM_F_ACK;
            }
            let hdr = NlMsgHdr {
                nlmsg_len: std::mem::size_of::<NlMsgHdr>() as u32,
                nlmsg_type: msg_type,
                nlmsg_flags: flags,
                nlmsg_seq: 0,
                nlmsg_pid: self.index,
            };

            let mut sa: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
            sa.nl_family = libc::AF_NETLINK as u16;

            let ret = unsafe {
                libc::sendto(
                    self.sock_fd,
                    &hdr as *const _ as *const libc::c_void,
                    hdr.nlmsg_len as usize,
                    0,
                    &sa as *const _ as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_nl>() as u32,
                )
            };
            if ret <= 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        /// Receive one datagram. `nonblocking` mirrors `MSG_DONTWAIT` in
        /// `colo_proxy_checkpoint`; `None` means nothing arrived (timeout
        /// or would-block), which the caller treats as "no checkpoint".
        fn recv_raw(&self, nonblocking: bool) -> io::Result<Option<Vec<u8>>> {
            let flags = if nonblocking { libc::MSG_DONTWAIT } else { 0 };
            let mut buf = vec![0u8; 16384];
            let ret = unsafe {
                libc::recv(
                    self.sock_fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    flags,
                )
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if nonblocking
                    && matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    )
                {
                    return Ok(None);
                }
                return Err(err);
            }
            buf.truncate(ret as usize);
            Ok(Some(buf))
        }

        pub fn open() -> io::Result<Self> {
            let sock_fd = unsafe { libc::socket(libc::AF_NETLINK, libc::SOCK_RAW, NETLINK_COLO) };
            if sock_fd < 0 {
                return Err(io::Error::last_os_error());
            }

            let mut index = 1u32;
            loop {
                if index > 10 {
                    unsafe { libc::close(sock_fd) };
                    return Err(io::Error::new(io::ErrorKind::AddrInUse, "netlink bind error"));
                }

                let mut sa: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
                sa.nl_family = libc::AF_NETLINK as u16;
                sa.nl_pid = index;

                let ret = unsafe {
                    libc::bind(
                        sock_fd,
                        &sa as *const _ as *const libc::sockaddr,
                        std::mem::size_of::<libc::sockaddr_nl>() as u32,
                    )
                };
                if ret == 0 {
                    break;
                }
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::AddrInUse {
                    index += 1;
                    continue;
                }
                unsafe { libc::close(sock_fd) };
                return Err(err);
            }

            Ok(NetlinkColoProxy { sock_fd, index })
        }

        fn set_recv_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
            let tv = libc::timeval {
                tv_sec: timeout.map(|d| d.as_secs() as i64).unwrap_or(0),
                tv_usec: timeout.map(|d| d.subsec_micros() as i64).unwrap_or(0),
            };
            let ret = unsafe {
                libc::setsockopt(
                    self.sock_fd,
                    libc::SOL_SOCKET,
                    libc::SO_RCVTIMEO,
                    &tv as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::timeval>() as u32,
                )
            };
            if ret != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ColoProxyClient for NetlinkColoProxy {
        async fn init(&mut self) -> Result<(), Error> {
            self.send_raw(COLO_PROXY_INIT, true)
                .map_err(|e| Error::failed(e.to_string()))?;
            self.set_recv_timeout(Some(Duration::from_millis(500)))
                .map_err(|e| Error::failed(e.to_string()))?;
            let reply = self.recv_raw(false).map_err(|e| Error::failed(e.to_string()))?;
            self.set_recv_timeout(None).map_err(|e| Error::failed(e.to_string()))?;
            if let Some(buf) = reply {
                if buf.len() >= 2 {
                    let msg_type = u16::from_ne_bytes([buf[4], buf[5]]);
                    if msg_type == NLMSG_ERROR {
                        return Err(Error::failed("colo-proxy init returned an error"));
                    }
                }
            }
            Ok(())
        }

        async fn preresume_checkpoint(&mut self) -> Result<(), Error> {
            self.send_raw(COLO_CHECKPOINT, false)
                .map_err(|e| Error::failed(e.to_string()))
        }

        async fn query_checkpoint(&mut self) -> Result<bool, Error> {
            match self.recv_raw(true).map_err(|e| Error::failed(e.to_string()))? {
                None => Ok(false),
                Some(buf) => Ok(buf.last().copied().unwrap_or(0) != 0),
            }
        }

        async fn failover(&mut self) -> Result<(), Error> {
            self.send_raw(COLO_FAILOVER, false)
                .map_err(|e| Error::failed(e.to_string()))
        }

        async fn teardown(&mut self) {
            unsafe { libc::close(self.sock_fd) };
        }
    }

    impl Drop for NetlinkColoProxy {
        fn drop(&mut self) {
            unsafe { libc::close(self.sock_fd) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_proxy_reports_checkpoint_then_clears() {
        let mut proxy = FakeColoProxy::default();
        proxy.init().await.unwrap();
        proxy.checkpoint_due = true;
        assert!(proxy.query_checkpoint().await.unwrap());
        assert!(!proxy.query_checkpoint().await.unwrap());
    }
}
