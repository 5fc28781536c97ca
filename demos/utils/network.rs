use std::io;
use std::process::Command;

use log::info;

/// Assign `ip_cidr` to `iface_name` and bring the link up using `ip(8)`
pub fn configure_interface(iface_name: &str, ip_cidr: &str) -> io::Result<()> {
    run_ip(&["addr", "add", ip_cidr, "dev", iface_name])?;
    run_ip(&["link", "set", "up", "dev", iface_name])?;

    info!(
        "Interface {} configured with IP {} and brought up",
        iface_name, ip_cidr
    );
    Ok(())
}

/// Pin `addr` to `mac` on `iface_name`, so the host sends to it without ARP
pub fn add_static_neighbor(iface_name: &str, addr: &str, mac: &str) -> io::Result<()> {
    run_ip(&[
        "neigh", "replace", addr, "lladdr", mac, "nud", "permanent", "dev", iface_name,
    ])?;
    info!("Static neighbour {} -> {} on {}", addr, mac, iface_name);
    Ok(())
}

fn run_ip(args: &[&str]) -> io::Result<()> {
    let status = Command::new("ip").args(args).status()?;
    if !status.success() {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("`ip {}` failed with {}", args.join(" "), status),
        ));
    }
    Ok(())
}
