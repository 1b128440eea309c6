//! DHCPv4 lease pool for stations associated with the access point
//!
//! Pure packet handling: the firmware owns the UDP socket on port 67 and
//! feeds every datagram through [`LeasePool::handle`], broadcasting whatever
//! reply comes back. Time is passed in as milliseconds since boot.

use core::net::Ipv4Addr;

use heapless::Vec;
use log::debug;

use crate::config::NetworkConfig;

pub const SERVER_PORT: u16 = 67;
pub const CLIENT_PORT: u16 = 68;
/// Room for a full BOOTP frame plus options
pub const FRAME_SIZE: usize = 576;

/// Upper bound on concurrently leased addresses
pub const MAX_LEASES: usize = 10;

const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
const MIN_FRAME_LEN: usize = 240;
/// BOOTP replies are zero-padded to at least this size
const MIN_REPLY_LEN: usize = 300;

const OPT_SUBNET_MASK: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_DNS: u8 = 6;
const OPT_BROADCAST: u8 = 28;
const OPT_REQUESTED_IP: u8 = 50;
const OPT_LEASE_TIME: u8 = 51;
const OPT_MESSAGE_TYPE: u8 = 53;
const OPT_SERVER_ID: u8 = 54;
const OPT_RENEWAL: u8 = 58;
const OPT_REBINDING: u8 = 59;
const OPT_END: u8 = 255;
const OPT_PAD: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Discover,
    Offer,
    Request,
    Decline,
    Ack,
    Nak,
    Release,
    Inform,
    Other(u8),
}

impl MessageType {
    const fn from_code(code: u8) -> Self {
        match code {
            1 => Self::Discover,
            2 => Self::Offer,
            3 => Self::Request,
            4 => Self::Decline,
            5 => Self::Ack,
            6 => Self::Nak,
            7 => Self::Release,
            8 => Self::Inform,
            other => Self::Other(other),
        }
    }

    const fn code(self) -> u8 {
        match self {
            Self::Discover => 1,
            Self::Offer => 2,
            Self::Request => 3,
            Self::Decline => 4,
            Self::Ack => 5,
            Self::Nak => 6,
            Self::Release => 7,
            Self::Inform => 8,
            Self::Other(code) => code,
        }
    }
}

/// The fields of a client request the server acts on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageType,
    pub transaction_id: u32,
    pub flags: u16,
    pub client_mac: [u8; 6],
    pub client_ip: Option<Ipv4Addr>,
    pub requested_ip: Option<Ipv4Addr>,
    pub server_id: Option<Ipv4Addr>,
}

fn ipv4_at(bytes: &[u8]) -> Ipv4Addr {
    Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])
}

/// Parses a BOOTREQUEST from an Ethernet-type client; anything else is `None`.
pub fn parse_message(frame: &[u8]) -> Option<Message> {
    if frame.len() < MIN_FRAME_LEN || frame[0] != 1 {
        return None;
    }
    // htype 1 (Ethernet), hlen 6
    if frame[1] != 1 || frame[2] != 6 {
        return None;
    }
    if frame[236..240] != MAGIC_COOKIE {
        return None;
    }

    let mut kind = None;
    let mut requested_ip = None;
    let mut server_id = None;

    let mut idx = MIN_FRAME_LEN;
    while idx < frame.len() {
        let opt = frame[idx];
        idx += 1;
        match opt {
            OPT_PAD => continue,
            OPT_END => break,
            _ => {
                let Some(&len) = frame.get(idx) else { break };
                let len = len as usize;
                idx += 1;
                let Some(data) = frame.get(idx..idx + len) else {
                    break;
                };
                match (opt, len) {
                    (OPT_MESSAGE_TYPE, 1) => kind = Some(MessageType::from_code(data[0])),
                    (OPT_REQUESTED_IP, 4) => requested_ip = Some(ipv4_at(data)),
                    (OPT_SERVER_ID, 4) => server_id = Some(ipv4_at(data)),
                    _ => {}
                }
                idx += len;
            }
        }
    }

    let ciaddr = ipv4_at(&frame[12..16]);
    let mut client_mac = [0u8; 6];
    client_mac.copy_from_slice(&frame[28..34]);

    Some(Message {
        kind: kind?,
        transaction_id: u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]),
        flags: u16::from_be_bytes([frame[10], frame[11]]),
        client_mac,
        client_ip: (!ciaddr.is_unspecified()).then_some(ciaddr),
        requested_ip,
        server_id,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Lease {
    mac: [u8; 6],
    ip: Ipv4Addr,
    expires_at_ms: u64,
}

/// An encoded reply and where to send it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub len: usize,
    /// The client's own address when it is renewing one, otherwise the
    /// limited broadcast address; clients without an address only accept
    /// limited broadcast.
    pub destination: Ipv4Addr,
}

/// Address pool and lease table of the leasing facility
#[derive(Debug)]
pub struct LeasePool {
    server_ip: Ipv4Addr,
    netmask: Ipv4Addr,
    broadcast: Ipv4Addr,
    pool_start: u32,
    pool_size: u8,
    lease_secs: u32,
    leases: Vec<Lease, MAX_LEASES>,
}

impl LeasePool {
    pub fn new(config: &NetworkConfig<'_>) -> Self {
        Self {
            server_ip: config.static_address,
            netmask: config.netmask,
            broadcast: config.broadcast_address(),
            pool_start: u32::from(config.lease_pool_start()),
            pool_size: config.leasing.pool_size.min(MAX_LEASES as u8),
            lease_secs: config.leasing.lease_secs,
            leases: Vec::new(),
        }
    }

    pub fn active_leases(&self) -> usize {
        self.leases.len()
    }

    /// Drops every lease, used when the facility is stopped.
    pub fn clear(&mut self) {
        self.leases.clear();
    }

    fn in_pool(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip)
            .checked_sub(self.pool_start)
            .is_some_and(|offset| offset < u32::from(self.pool_size))
    }

    /// Whether a live lease for `ip` belongs to a client other than `mac`
    fn held_by_other(&self, ip: Ipv4Addr, mac: [u8; 6], now_ms: u64) -> bool {
        self.leases
            .iter()
            .any(|l| l.ip == ip && l.mac != mac && l.expires_at_ms > now_ms)
    }

    /// Finds or creates the lease for `mac`, honoring `requested` when it is
    /// free and inside the pool.
    fn ensure_lease(
        &mut self,
        mac: [u8; 6],
        requested: Option<Ipv4Addr>,
        now_ms: u64,
    ) -> Option<Ipv4Addr> {
        self.leases.retain(|lease| lease.expires_at_ms > now_ms);
        let expires_at_ms = now_ms + u64::from(self.lease_secs) * 1000;

        let wanted = requested
            .filter(|ip| self.in_pool(*ip))
            .filter(|ip| self.leases.iter().all(|l| l.mac == mac || l.ip != *ip));

        if let Some(existing) = self.leases.iter_mut().find(|l| l.mac == mac) {
            if let Some(ip) = wanted {
                existing.ip = ip;
            }
            existing.expires_at_ms = expires_at_ms;
            return Some(existing.ip);
        }

        let ip = wanted.or_else(|| {
            (0..u32::from(self.pool_size))
                .filter_map(|offset| self.pool_start.checked_add(offset))
                .map(Ipv4Addr::from)
                .find(|candidate| self.leases.iter().all(|l| l.ip != *candidate))
        })?;

        self.leases
            .push(Lease {
                mac,
                ip,
                expires_at_ms,
            })
            .ok()?;
        Some(ip)
    }

    /// Processes one datagram and writes the reply into `reply`.
    ///
    /// Returns `None` when nothing is to be sent (unparseable frame, request
    /// addressed to another server, release, exhausted pool).
    pub fn handle(&mut self, frame: &[u8], now_ms: u64, reply: &mut [u8]) -> Option<Reply> {
        let message = parse_message(frame)?;
        debug!("DHCP {:?} from {:02x?}", message.kind, message.client_mac);

        let (kind, offered) = match message.kind {
            MessageType::Discover => {
                let ip = self.ensure_lease(message.client_mac, message.requested_ip, now_ms)?;
                (MessageType::Offer, ip)
            }
            MessageType::Request => {
                if message.server_id.is_some_and(|id| id != self.server_ip) {
                    // The client picked another server's offer
                    self.leases.retain(|l| l.mac != message.client_mac);
                    return None;
                }
                let requested = message.requested_ip.or(message.client_ip);
                if requested.is_some_and(|ip| {
                    !self.in_pool(ip) || self.held_by_other(ip, message.client_mac, now_ms)
                }) {
                    (MessageType::Nak, Ipv4Addr::UNSPECIFIED)
                } else {
                    let ip = self.ensure_lease(message.client_mac, requested, now_ms)?;
                    (MessageType::Ack, ip)
                }
            }
            MessageType::Decline | MessageType::Release => {
                self.leases.retain(|l| l.mac != message.client_mac);
                return None;
            }
            _ => return None,
        };

        debug!("DHCP {:?} {} to {:02x?}", kind, offered, message.client_mac);
        let len = self.build_reply(reply, &message, kind, offered)?;
        let destination = match message.client_ip {
            Some(ip) if kind != MessageType::Nak => ip,
            _ => Ipv4Addr::BROADCAST,
        };
        Some(Reply { len, destination })
    }

    fn build_reply(
        &self,
        out: &mut [u8],
        request: &Message,
        kind: MessageType,
        offered: Ipv4Addr,
    ) -> Option<usize> {
        if out.len() < MIN_REPLY_LEN {
            return None;
        }

        out.fill(0);
        out[0] = 2; // BOOTREPLY
        out[1] = 1;
        out[2] = 6;
        out[4..8].copy_from_slice(&request.transaction_id.to_be_bytes());
        out[10..12].copy_from_slice(&request.flags.to_be_bytes());
        out[16..20].copy_from_slice(&offered.octets());
        out[20..24].copy_from_slice(&self.server_ip.octets());
        out[28..34].copy_from_slice(&request.client_mac);
        out[236..240].copy_from_slice(&MAGIC_COOKIE);

        let server = self.server_ip.octets();
        let mut writer = OptionWriter {
            out,
            idx: MIN_FRAME_LEN,
        };
        writer.put(OPT_MESSAGE_TYPE, &[kind.code()])?;
        writer.put(OPT_SERVER_ID, &server)?;

        if kind != MessageType::Nak {
            let lease = self.lease_secs;
            writer.put(OPT_LEASE_TIME, &lease.to_be_bytes())?;
            writer.put(OPT_RENEWAL, &(lease / 2).to_be_bytes())?;
            writer.put(OPT_REBINDING, &((u64::from(lease) * 7 / 8) as u32).to_be_bytes())?;
            writer.put(OPT_SUBNET_MASK, &self.netmask.octets())?;
            writer.put(OPT_ROUTER, &server)?;
            writer.put(OPT_DNS, &server)?;
            writer.put(OPT_BROADCAST, &self.broadcast.octets())?;
        }

        *writer.out.get_mut(writer.idx)? = OPT_END;
        Some((writer.idx + 1).max(MIN_REPLY_LEN))
    }
}

struct OptionWriter<'a> {
    out: &'a mut [u8],
    idx: usize,
}

impl OptionWriter<'_> {
    fn put(&mut self, code: u8, payload: &[u8]) -> Option<()> {
        let end = self.idx + 2 + payload.len();
        let dest = self.out.get_mut(self.idx..end)?;
        dest[0] = code;
        dest[1] = payload.len() as u8;
        dest[2..].copy_from_slice(payload);
        self.idx = end;
        Some(())
    }
}
