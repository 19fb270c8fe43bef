//! Name of the client behind a peer id.
//!
//! Azureus-style ids start with `-`, two letters of the client and four of
//! the version: `-TR2940-`. Shadow-style ids start with one letter of the
//! client followed by the version: `S58B-----`.

const UNKNOWN: &str = "unknown";

fn azureus(code: &[u8]) -> Option<&'static str> {
    let name = match code {
        b"AG" | b"A~" => "Ares",
        b"AR" => "Arctic",
        b"AS" => "Acgist Snail",
        b"AV" => "Avicora",
        b"AX" => "BitPump",
        b"AZ" => "Azureus",
        b"BB" => "BitBuddy",
        b"BC" => "BitComet",
        b"BF" => "Bitflu",
        b"BG" => "BTG",
        b"BR" => "BitRocket",
        b"BS" => "BTSlave",
        b"BX" => "~Bittorrent X",
        b"CD" => "Enhanced CTorrent",
        b"CT" => "CTorrent",
        b"DE" => "DelugeTorrent",
        b"DP" => "Propagate Data Client",
        b"EB" => "EBit",
        b"ES" => "electric sheep",
        b"FT" => "FoxTorrent",
        b"FW" => "FrostWire",
        b"FX" => "Freebox BitTorrent",
        b"GS" => "GSTorrent",
        b"HL" => "Halite",
        b"HN" => "Hydranode",
        b"KG" => "KGet",
        b"KT" => "KTorrent",
        b"LH" => "LH-ABC",
        b"LP" => "Lphant",
        b"LT" => "libtorrent",
        b"lt" => "libTorrent",
        b"LW" => "LimeWire",
        b"MO" => "MonoTorrent",
        b"MP" => "MooPolice",
        b"MR" => "Miro",
        b"MT" => "MoonlightTorrent",
        b"NX" => "Net Transport",
        b"PD" => "Pando",
        b"PI" => "PicoTorrent",
        b"qB" => "qBittorrent",
        b"QD" => "QQDownload",
        b"QT" => "Qt 4 Torrent example",
        b"RT" => "Retriever",
        b"RV" => "Rivulet",
        b"S~" => "Shareaza alpha/beta",
        b"SB" => "~Swiftbit",
        b"SS" => "SwarmScope",
        b"ST" => "SymTorrent",
        b"st" => "sharktorrent",
        b"SZ" => "Shareaza",
        b"TN" => "TorrentDotNET",
        b"TR" => "Transmission",
        b"TS" => "Torrentstorm",
        b"TT" => "TuoTu",
        b"UL" => "uLeecher!",
        b"UT" => "µTorrent",
        b"UW" => "µTorrent Web",
        b"VG" => "Vagaa",
        b"WD" => "WebTorrent Desktop",
        b"WT" => "BitLet",
        b"WW" => "WebTorrent",
        b"WY" => "FireTorrent",
        b"XL" => "Xunlei",
        b"XT" => "XanTorrent",
        b"XX" => "Xtorrent",
        b"ZT" => "ZipTorrent",
        _ => return None,
    };
    Some(name)
}

fn shadow(code: u8) -> Option<&'static str> {
    let name = match code {
        b'A' => "ABC",
        b'O' => "Osprey Permaseed",
        b'Q' => "BTQueue",
        b'R' => "Tribler",
        b'S' => "Shadow's client",
        b'T' => "BitTornado",
        b'U' => "UPnP NAT Bit Torrent",
        _ => return None,
    };
    Some(name)
}

fn is_version(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'.' || b == b'-'
}

/// Name of the client that generated `peer_id`.
pub fn client_name(peer_id: &[u8; 20]) -> &'static str {
    if peer_id[0] == b'-' && peer_id[7] == b'-' {
        return azureus(&peer_id[1..3]).unwrap_or(UNKNOWN);
    }

    // mainline: M4-4-0--
    if peer_id[0] == b'M' && peer_id[1].is_ascii_digit() && peer_id[2] == b'-'
    {
        return "Mainline";
    }

    if peer_id[1..6].iter().all(|b| is_version(*b)) {
        if let Some(name) = shadow(peer_id[0]) {
            return name;
        }
    }

    UNKNOWN
}
