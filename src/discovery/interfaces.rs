use std::net::Ipv4Addr;
use if_addrs::IfAddr;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashSet;

/// An IPv4 address of a local network interface
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct LocalInterface {
    pub name: String,
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub broadcast: Option<Ipv4Addr>,
}

impl LocalInterface {
    /// true if `ip` is in this interface's subnet
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = u32::from(self.netmask);
        u32::from(self.ip) & mask == u32::from(ip) & mask
    }

    pub fn is_loopback(&self) -> bool {
        self.ip.is_loopback()
    }
}

/// Enumeration of local interfaces, abstracted for testing
#[cfg_attr(test, automock)]
pub trait InterfaceSource: Send + Sync {
    fn interfaces(&self) -> anyhow::Result<Vec<LocalInterface>>;
}

pub struct SystemInterfaces;

impl InterfaceSource for SystemInterfaces {
    fn interfaces(&self) -> anyhow::Result<Vec<LocalInterface>> {
        let result = if_addrs::get_if_addrs()?
            .into_iter()
            .filter_map(|iface| match iface.addr {
                IfAddr::V4(v4) => Some(LocalInterface {
                    name: iface.name,
                    ip: v4.ip,
                    netmask: v4.netmask,
                    broadcast: v4.broadcast,
                }),
                IfAddr::V6(_) => None,
            })
            .collect();
        Ok(result)
    }
}

/// Addresses that appeared in `new` and addresses that disappeared from `old`
pub fn diff(old: &[LocalInterface], new: &[LocalInterface]) -> (Vec<LocalInterface>, Vec<LocalInterface>) {
    let old_set = old.iter().collect::<FxHashSet<_>>();
    let new_set = new.iter().collect::<FxHashSet<_>>();

    let added = new.iter()
        .filter(|i| !old_set.contains(i))
        .cloned()
        .collect();
    let removed = old.iter()
        .filter(|i| !new_set.contains(i))
        .cloned()
        .collect();
    (added, removed)
}

/// The first non-loopback address of an allowed interface, falling back to loopback
pub fn default_unique_ip(interfaces: &[LocalInterface], allowed: impl Fn(&str) -> bool) -> Ipv4Addr {
    interfaces.iter()
        .filter(|i| allowed(&i.name))
        .find(|i| !i.is_loopback())
        .map(|i| i.ip)
        .unwrap_or(Ipv4Addr::LOCALHOST)
}

/// Subnet broadcast addresses of allowed non-loopback interfaces
pub fn broadcast_addresses(interfaces: &[LocalInterface], allowed: impl Fn(&str) -> bool) -> Vec<Ipv4Addr> {
    let mut result = interfaces.iter()
        .filter(|i| allowed(&i.name) && !i.is_loopback())
        .filter_map(|i| i.broadcast)
        .collect::<Vec<_>>();
    result.sort();
    result.dedup();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn iface(name: &str, ip: [u8; 4], netmask: [u8; 4], broadcast: Option<[u8; 4]>) -> LocalInterface {
        LocalInterface {
            name: name.to_string(),
            ip: ip.into(),
            netmask: netmask.into(),
            broadcast: broadcast.map(Ipv4Addr::from),
        }
    }

    #[rstest]
    #[case([10, 0, 0, 7], true)]
    #[case([10, 0, 1, 7], false)]
    #[case([11, 0, 0, 7], false)]
    fn test_contains(#[case] ip: [u8; 4], #[case] expected: bool) {
        let i = iface("eth0", [10, 0, 0, 1], [255, 255, 255, 0], None);
        assert_eq!(i.contains(ip.into()), expected);
    }

    #[test]
    fn test_diff() {
        let a = iface("eth0", [10, 0, 0, 1], [255, 255, 255, 0], None);
        let b = iface("eth1", [10, 0, 1, 1], [255, 255, 255, 0], None);
        let c = iface("eth2", [10, 0, 2, 1], [255, 255, 255, 0], None);

        let (added, removed) = diff(&[a.clone(), b.clone()], &[b.clone(), c.clone()]);
        assert_eq!(added, vec![c]);
        assert_eq!(removed, vec![a]);

        let (added, removed) = diff(&[b.clone()], &[b]);
        assert!(added.is_empty());
        assert!(removed.is_empty());
    }

    #[test]
    fn test_default_unique_ip() {
        let interfaces = vec![
            iface("lo", [127, 0, 0, 1], [255, 0, 0, 0], None),
            iface("eth0", [10, 0, 0, 1], [255, 255, 255, 0], None),
            iface("eth1", [10, 0, 1, 1], [255, 255, 255, 0], None),
        ];
        assert_eq!(default_unique_ip(&interfaces, |_| true), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(default_unique_ip(&interfaces, |n| n == "eth1"), Ipv4Addr::new(10, 0, 1, 1));
        assert_eq!(default_unique_ip(&interfaces, |n| n == "lo"), Ipv4Addr::LOCALHOST);
    }

    #[test]
    fn test_broadcast_addresses() {
        let interfaces = vec![
            iface("lo", [127, 0, 0, 1], [255, 0, 0, 0], Some([127, 255, 255, 255])),
            iface("eth0", [10, 0, 0, 1], [255, 255, 255, 0], Some([10, 0, 0, 255])),
            iface("eth0", [10, 0, 0, 2], [255, 255, 255, 0], Some([10, 0, 0, 255])),
            iface("eth1", [10, 0, 1, 1], [255, 255, 255, 0], None),
        ];
        assert_eq!(broadcast_addresses(&interfaces, |_| true), vec![Ipv4Addr::new(10, 0, 0, 255)]);
        assert!(broadcast_addresses(&interfaces, |n| n == "eth1").is_empty());
    }

    #[test]
    fn test_mock_source() {
        let mut source = MockInterfaceSource::new();
        source.expect_interfaces()
            .times(1)
            .returning(|| Ok(vec![iface("eth0", [10, 0, 0, 1], [255, 255, 255, 0], None)]));

        let interfaces = source.interfaces().unwrap();
        assert_eq!(interfaces.len(), 1);
    }
}
