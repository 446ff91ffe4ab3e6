//! The virtual point-to-point interface: `/dev/net/tun` opened in `IFF_TUN |
//! IFF_NO_PI` mode, so `read`/`write` see raw IP frames with no link-layer
//! header and no packet-information prefix.

use std::ffi::CStr;
use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;

const DEV_NET_TUN: &[u8] = b"/dev/net/tun\0";

const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;
const IFNAMSIZ: usize = 16;

// _IOW('T', 202, int), per linux/if_tun.h. Not re-exported by the `libc`
// crate, so it is defined here the way the kernel headers define it.
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

#[repr(C)]
struct IfReq {
    name: [libc::c_char; IFNAMSIZ],
    flags: libc::c_short,
    // padding to match the kernel's `struct ifreq` size; the remaining union
    // members are never touched by this driver.
    _pad: [u8; 24 - std::mem::size_of::<libc::c_short>()],
}

#[derive(Debug, Error)]
pub enum TunError {
    #[error("unable to open /dev/net/tun: {0}")]
    Open(#[source] io::Error),
    #[error("unable to configure tun interface: {0}")]
    Configure(#[source] io::Error),
}

pub struct TunDevice {
    fd: RawFd,
    mtu: usize,
    name: String,
}

impl TunDevice {
    /// Opens a new point-to-point layer-3 tunnel interface sized for frames
    /// up to `mtu` bytes. The interface must still be brought up and
    /// addressed by an out-of-band action (e.g. `ip link set up`).
    pub fn open(mtu: usize) -> Result<TunDevice, TunError> {
        let fd = unsafe { libc::open(DEV_NET_TUN.as_ptr() as *const libc::c_char, libc::O_RDWR) };
        if fd < 0 {
            return Err(TunError::Open(io::Error::last_os_error()));
        }

        let mut req = IfReq {
            name: [0; IFNAMSIZ],
            flags: IFF_TUN | IFF_NO_PI,
            _pad: [0; 24 - std::mem::size_of::<libc::c_short>()],
        };

        let ret = unsafe { libc::ioctl(fd, TUNSETIFF, &mut req as *mut IfReq) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(TunError::Configure(err));
        }

        let name = unsafe { CStr::from_ptr(req.name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        Ok(TunDevice { fd, mtu, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Reads one frame into `buf`, returning its length. Never returns more
    /// than `mtu` bytes; `buf` must be at least that large.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Writes one frame.
    pub fn write(&mut self, buf: &[u8]) -> io::Result<()> {
        let n = unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        if (n as usize) != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "short write to tun device",
            ));
        }
        Ok(())
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for TunDevice {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
