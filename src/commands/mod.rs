/// Utilities the hub runs on its own host
use crate::error::{HubError, HubResult};
use crate::stream::{exec_command, HubStream};
use async_trait::async_trait;
use std::ffi::CStr;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

const MAX_PASSWD_BUF: usize = 1 << 20;

/// Host-local operations the workflows depend on
#[async_trait]
pub trait LocalCommands: Send + Sync {
    /// Engine version installed on the hub host
    async fn engine_version(&self) -> HubResult<String>;

    /// Fast shutdown of the coordinator owning `data_dir`
    async fn stop_coordinator(&self, data_dir: &str) -> HubResult<()>;

    /// Start the whole cluster through the coordinator, relaying the
    /// utility's output to the stream
    async fn start_cluster(&self, data_dir: &str, verbose: bool, stream: &HubStream) -> HubResult<()>;

    /// Non-loopback interface addresses of this host in CIDR form
    fn host_addrs_no_loopback(&self) -> HubResult<Vec<String>>;

    fn current_user(&self) -> HubResult<String>;
}

/// Runs the utilities shipped under the database installation root
#[derive(Debug, Clone)]
pub struct GpHomeCommands {
    gphome: PathBuf,
}

impl GpHomeCommands {
    pub fn new<P: Into<PathBuf>>(gphome: P) -> Self {
        Self {
            gphome: gphome.into(),
        }
    }

    fn utility(&self, name: &str) -> PathBuf {
        utility_path(&self.gphome, name)
    }
}

pub fn utility_path(gphome: &Path, name: &str) -> PathBuf {
    gphome.join("bin").join(name)
}

fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', "'\\''"))
}

/// `pg_ctl stop` for a data directory
pub fn pg_ctl_stop_command(gphome: &Path, data_dir: &str) -> Command {
    let mut cmd = Command::new(utility_path(gphome, "pg_ctl"));
    cmd.arg("stop").arg("--pgdata").arg(data_dir);
    cmd
}

/// `gpstart` wrapped so the installation environment is sourced first
pub fn gpstart_command(gphome: &Path, data_dir: &str, verbose: bool) -> Command {
    let mut gpstart = format!(
        "{} -a -d {}",
        shell_quote(&utility_path(gphome, "gpstart").to_string_lossy()),
        shell_quote(data_dir)
    );
    if verbose {
        gpstart.push_str(" -v");
    }

    let source = gphome.join("greenplum_path.sh");
    let mut cmd = Command::new("bash");
    cmd.arg("-c").arg(format!(
        "source {} && {}",
        shell_quote(&source.to_string_lossy()),
        gpstart
    ));
    cmd
}

#[async_trait]
impl LocalCommands for GpHomeCommands {
    async fn engine_version(&self) -> HubResult<String> {
        let output = Command::new(self.utility("postgres"))
            .arg("--gp-version")
            .output()
            .await
            .map_err(|e| HubError::command(format!("fetching postgres gp-version: {}", e)))?;

        if !output.status.success() {
            return Err(HubError::command(format!(
                "fetching postgres gp-version: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn stop_coordinator(&self, data_dir: &str) -> HubResult<()> {
        let output = pg_ctl_stop_command(&self.gphome, data_dir)
            .output()
            .await
            .map_err(|e| HubError::command(format!("executing pg_ctl stop: {}", e)))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(HubError::command(format!(
                "executing pg_ctl stop: {}{}, {}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr),
                output.status
            )))
        }
    }

    async fn start_cluster(&self, data_dir: &str, verbose: bool, stream: &HubStream) -> HubResult<()> {
        exec_command(stream, gpstart_command(&self.gphome, data_dir, verbose))
            .await
            .map_err(|e| e.context("executing gpstart"))
    }

    fn host_addrs_no_loopback(&self) -> HubResult<Vec<String>> {
        let addrs = interface_addrs()?;
        debug!("Local interface addresses: {:?}", addrs);
        Ok(format_no_loopback(&addrs))
    }

    fn current_user(&self) -> HubResult<String> {
        effective_user_name()
    }
}

/// Render addresses as `ip/prefix`, skipping loopback ones
pub fn format_no_loopback(addrs: &[(IpAddr, u8)]) -> Vec<String> {
    addrs
        .iter()
        .filter(|(ip, _)| !ip.is_loopback())
        .map(|(ip, prefix)| format!("{}/{}", ip, prefix))
        .collect()
}

fn prefix_len(mask: IpAddr) -> u8 {
    match mask {
        IpAddr::V4(mask) => u32::from(mask).count_ones() as u8,
        IpAddr::V6(mask) => u128::from(mask).count_ones() as u8,
    }
}

/// Safety: `sa` must be null or point to a valid socket address
unsafe fn sockaddr_ip(sa: *const libc::sockaddr) -> Option<IpAddr> {
    if sa.is_null() {
        return None;
    }
    match i32::from((*sa).sa_family) {
        libc::AF_INET => {
            let sin = &*(sa as *const libc::sockaddr_in);
            Some(IpAddr::V4(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr))))
        }
        libc::AF_INET6 => {
            let sin6 = &*(sa as *const libc::sockaddr_in6);
            Some(IpAddr::V6(Ipv6Addr::from(sin6.sin6_addr.s6_addr)))
        }
        _ => None,
    }
}

/// Address and prefix length of every configured interface address
fn interface_addrs() -> HubResult<Vec<(IpAddr, u8)>> {
    let mut ifap: *mut libc::ifaddrs = std::ptr::null_mut();
    if unsafe { libc::getifaddrs(&mut ifap) } != 0 {
        return Err(io::Error::last_os_error().into());
    }

    let mut addrs = Vec::new();
    let mut cur = ifap;
    while !cur.is_null() {
        let ifa = unsafe { &*cur };
        if let Some(ip) = unsafe { sockaddr_ip(ifa.ifa_addr) } {
            let prefix = unsafe { sockaddr_ip(ifa.ifa_netmask) }
                .map(prefix_len)
                .unwrap_or(0);
            addrs.push((ip, prefix));
        }
        cur = ifa.ifa_next;
    }

    unsafe { libc::freeifaddrs(ifap) };
    Ok(addrs)
}

/// Login name of the effective user, read from the password database
fn effective_user_name() -> HubResult<String> {
    let uid = unsafe { libc::geteuid() };
    let mut buf_len = match unsafe { libc::sysconf(libc::_SC_GETPW_R_SIZE_MAX) } {
        n if n > 0 => n as usize,
        _ => 1024,
    };

    loop {
        let mut buf: Vec<libc::c_char> = vec![0; buf_len];
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut entry: *mut libc::passwd = std::ptr::null_mut();
        let rc = unsafe {
            libc::getpwuid_r(uid, &mut pwd, buf.as_mut_ptr(), buf.len(), &mut entry)
        };

        if rc == libc::ERANGE && buf_len < MAX_PASSWD_BUF {
            buf_len *= 2;
            continue;
        }
        if rc != 0 {
            return Err(HubError::command(format!(
                "looking up user id {}: {}",
                uid,
                io::Error::from_raw_os_error(rc)
            )));
        }
        if entry.is_null() || pwd.pw_name.is_null() {
            return Err(HubError::command(format!("no password entry for user id {}", uid)));
        }

        // pw_name points into `buf`, copy it out before the buffer goes away
        let name = unsafe { CStr::from_ptr(pwd.pw_name) };
        return Ok(name.to_string_lossy().into_owned());
    }
}
