//! On-disk page image format.
//!
//! A 28-byte page header, then (for file layouts that need one) the
//! block manager's own framing, then cell-encoded entries. All integers
//! are little-endian on disk; `from_le_bytes` performs the byte swap on
//! big-endian hosts.

use bytes::Bytes;

use crate::{
    btree::{
        page::{ColVarSlot, RowSlot},
        refs::{FastDelete, RefAddr, RefKey, TimeAggregate},
        update::TimeWindow,
    },
    error::Error,
    io::{read_into, read_sized, Encodeable, SmallWriter},
    types::{Recno, TreeResult},
};

pub const PAGE_HEADER_SIZE: usize = 28;

pub const IMG_COMPRESSED: u8 = 0x01;
/// Every value on the page is zero length.
pub const IMG_EMPTY_V_ALL: u8 = 0x02;
/// No value on the page is zero length.
pub const IMG_EMPTY_V_NONE: u8 = 0x04;
pub const IMG_ENCRYPTED: u8 = 0x08;
/// Some versions of this page's content live in the history store.
pub const IMG_HS_UPDATE: u8 = 0x10;

pub const IMG_TYPE_INTERNAL: u8 = 0;
pub const IMG_TYPE_ROW_LEAF: u8 = 1;
pub const IMG_TYPE_COL_VAR_LEAF: u8 = 2;
pub const IMG_TYPE_COL_FIX_LEAF: u8 = 3;

const CELL_KEY_ROW: u8 = 0;
const CELL_KEY_RECNO: u8 = 1;
const CELL_VALUE: u8 = 2;
const CELL_VALUE_DEL: u8 = 3;
const CELL_ADDR: u8 = 4;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageHeader {
    /// Record number of the first key, zero for row stores.
    pub recno: Recno,
    pub write_gen: u64,
    pub mem_size: u32,
    pub entries: u32,
    pub img_type: u8,
    pub flags: u8,
}

impl PageHeader {
    pub fn encode_into(&self, w: &mut SmallWriter) {
        w.write(&self.recno);
        w.write(&self.write_gen);
        w.write(&self.mem_size);
        w.write(&self.entries);
        w.write(&self.img_type);
        w.write(&self.flags);
        // two reserved bytes
        w.write(&0u16);
    }

    pub fn decode_from<R: std::io::Read>(reader: &mut R) -> Self {
        let header = Self {
            recno: read_into(reader),
            write_gen: read_into(reader),
            mem_size: read_into(reader),
            entries: read_into(reader),
            img_type: read_into(reader),
            flags: read_into(reader),
        };
        let _reserved: u16 = read_into(reader);
        header
    }
}

fn write_tw(w: &mut SmallWriter, tw: &TimeWindow) {
    w.write_bytes(&tw.encode());
}

fn write_ta(w: &mut SmallWriter, ta: &TimeAggregate) {
    w.write(&ta.newest_start_durable_ts);
    w.write(&ta.newest_stop_durable_ts);
    w.write(&ta.newest_txn);
    w.write(&ta.oldest_start_ts);
    w.write(&ta.newest_stop_ts);
    w.write(&ta.prepared);
}

fn read_ta<R: std::io::Read>(reader: &mut R) -> TimeAggregate {
    TimeAggregate {
        newest_start_durable_ts: read_into(reader),
        newest_stop_durable_ts: read_into(reader),
        newest_txn: read_into(reader),
        oldest_start_ts: read_into(reader),
        newest_stop_ts: read_into(reader),
        prepared: read_into(reader),
    }
}

/// Everything the decoder can hand back.
pub enum DecodedPage {
    RowLeaf {
        header: PageHeader,
        slots: Vec<RowSlot>,
    },
    ColVarLeaf {
        header: PageHeader,
        start_recno: Recno,
        slots: Vec<ColVarSlot>,
    },
    ColFixLeaf {
        header: PageHeader,
        start_recno: Recno,
        bit_width: u8,
        values: Vec<u8>,
    },
    Internal {
        header: PageHeader,
        children: Vec<DecodedChild>,
    },
}

pub struct DecodedChild {
    pub key: RefKey,
    pub addr: RefAddr,
    pub fast_del: Option<FastDelete>,
}

fn empty_value_flags(values: impl Iterator<Item = usize>) -> u8 {
    let mut any_empty = false;
    let mut any_nonempty = false;
    for len in values {
        if len == 0 {
            any_empty = true;
        } else {
            any_nonempty = true;
        }
    }
    if any_empty && !any_nonempty {
        IMG_EMPTY_V_ALL
    } else if !any_empty {
        IMG_EMPTY_V_NONE
    } else {
        0
    }
}

pub fn encode_row_leaf(
    write_gen: u64,
    mem_size: usize,
    slots: &[RowSlot],
    hs_update: bool,
) -> Vec<u8> {
    let mut flags = empty_value_flags(slots.iter().map(|s| s.value.len()));
    if hs_update {
        flags |= IMG_HS_UPDATE;
    }
    let header = PageHeader {
        recno: 0,
        write_gen,
        mem_size: mem_size as u32,
        entries: slots.len() as u32,
        img_type: IMG_TYPE_ROW_LEAF,
        flags,
    };
    let mut w = SmallWriter::new();
    header.encode_into(&mut w);
    for slot in slots {
        w.write(&CELL_KEY_ROW);
        w.write_sized(&slot.key);
        w.write(&CELL_VALUE);
        write_tw(&mut w, &slot.tw);
        w.write_sized(&slot.value);
    }
    w.to_bytes()
}

pub fn encode_col_var_leaf(
    write_gen: u64,
    mem_size: usize,
    start_recno: Recno,
    slots: &[ColVarSlot],
    hs_update: bool,
) -> Vec<u8> {
    let mut flags = empty_value_flags(
        slots
            .iter()
            .filter_map(|s| s.value.as_ref().map(|(v, _)| v.len())),
    );
    if hs_update {
        flags |= IMG_HS_UPDATE;
    }
    let header = PageHeader {
        recno: start_recno,
        write_gen,
        mem_size: mem_size as u32,
        entries: slots.len() as u32,
        img_type: IMG_TYPE_COL_VAR_LEAF,
        flags,
    };
    let mut w = SmallWriter::new();
    header.encode_into(&mut w);
    for slot in slots {
        w.write(&slot.recno);
        w.write(&slot.rle);
        match &slot.value {
            Some((value, tw)) => {
                w.write(&CELL_VALUE);
                write_tw(&mut w, tw);
                w.write_sized(value);
            }
            None => {
                w.write(&CELL_VALUE_DEL);
            }
        }
    }
    w.to_bytes()
}

pub fn encode_col_fix_leaf(
    write_gen: u64,
    mem_size: usize,
    start_recno: Recno,
    bit_width: u8,
    values: &[u8],
) -> Vec<u8> {
    let header = PageHeader {
        recno: start_recno,
        write_gen,
        mem_size: mem_size as u32,
        entries: values.len() as u32,
        img_type: IMG_TYPE_COL_FIX_LEAF,
        flags: 0,
    };
    let mut w = SmallWriter::new();
    header.encode_into(&mut w);
    w.write(&bit_width);
    w.write_sized(values);
    w.to_bytes()
}

pub fn encode_internal(
    write_gen: u64,
    mem_size: usize,
    children: &[(RefKey, RefAddr, Option<FastDelete>)],
) -> Vec<u8> {
    let recno = match children.first() {
        Some((RefKey::Recno(r), _, _)) => *r,
        _ => 0,
    };
    let header = PageHeader {
        recno,
        write_gen,
        mem_size: mem_size as u32,
        entries: children.len() as u32,
        img_type: IMG_TYPE_INTERNAL,
        flags: 0,
    };
    let mut w = SmallWriter::new();
    header.encode_into(&mut w);
    for (key, addr, del) in children {
        match key {
            RefKey::Row(k) => {
                w.write(&CELL_KEY_ROW);
                w.write_sized(k);
            }
            RefKey::Recno(r) => {
                w.write(&CELL_KEY_RECNO);
                w.write(r);
            }
        }
        w.write(&CELL_ADDR);
        w.write_sized(&addr.addr);
        write_ta(&mut w, &addr.ta);
        match del {
            Some(d) => {
                w.write(&true);
                w.write(&d.txn_id);
                w.write(&d.ts);
                w.write(&d.durable_ts);
            }
            None => w.write(&false),
        }
    }
    w.to_bytes()
}

pub fn decode(image: &[u8]) -> TreeResult<DecodedPage> {
    if image.len() < PAGE_HEADER_SIZE {
        return Err(Error::corruption("page image shorter than its header"));
    }
    let mut reader = std::io::Cursor::new(image);
    let header = PageHeader::decode_from(&mut reader);

    match header.img_type {
        IMG_TYPE_ROW_LEAF => {
            let mut slots = Vec::with_capacity(header.entries as usize);
            for _ in 0..header.entries {
                let tag: u8 = read_into(&mut reader);
                if tag != CELL_KEY_ROW {
                    return Err(Error::corruption("expected a row key cell"));
                }
                let key = read_sized(&mut reader);
                let tag: u8 = read_into(&mut reader);
                if tag != CELL_VALUE {
                    return Err(Error::corruption("expected a value cell"));
                }
                let tw = TimeWindow::decode_from(&mut reader);
                let value = Bytes::from(read_sized(&mut reader));
                slots.push(RowSlot { key, value, tw });
            }
            Ok(DecodedPage::RowLeaf { header, slots })
        }
        IMG_TYPE_COL_VAR_LEAF => {
            let start_recno = header.recno;
            let mut slots = Vec::with_capacity(header.entries as usize);
            for _ in 0..header.entries {
                let recno: Recno = read_into(&mut reader);
                let rle: u64 = read_into(&mut reader);
                let tag: u8 = read_into(&mut reader);
                let value = match tag {
                    CELL_VALUE => {
                        let tw = TimeWindow::decode_from(&mut reader);
                        let value = Bytes::from(read_sized(&mut reader));
                        Some((value, tw))
                    }
                    CELL_VALUE_DEL => None,
                    _ => return Err(Error::corruption("bad column value cell")),
                };
                slots.push(ColVarSlot { recno, rle, value });
            }
            Ok(DecodedPage::ColVarLeaf {
                header,
                start_recno,
                slots,
            })
        }
        IMG_TYPE_COL_FIX_LEAF => {
            let start_recno = header.recno;
            let bit_width: u8 = read_into(&mut reader);
            let values = read_sized(&mut reader);
            if values.len() != header.entries as usize {
                return Err(Error::corruption("fixed-length entry count mismatch"));
            }
            Ok(DecodedPage::ColFixLeaf {
                header,
                start_recno,
                bit_width,
                values,
            })
        }
        IMG_TYPE_INTERNAL => {
            let mut children = Vec::with_capacity(header.entries as usize);
            for _ in 0..header.entries {
                let tag: u8 = read_into(&mut reader);
                let key = match tag {
                    CELL_KEY_ROW => RefKey::Row(read_sized(&mut reader)),
                    CELL_KEY_RECNO => RefKey::Recno(read_into(&mut reader)),
                    _ => return Err(Error::corruption("bad internal key cell")),
                };
                let tag: u8 = read_into(&mut reader);
                if tag != CELL_ADDR {
                    return Err(Error::corruption("expected an address cell"));
                }
                let addr = Bytes::from(read_sized(&mut reader));
                let ta = read_ta(&mut reader);
                let has_del: bool = read_into(&mut reader);
                let fast_del = if has_del {
                    Some(FastDelete {
                        txn_id: read_into(&mut reader),
                        ts: read_into(&mut reader),
                        durable_ts: read_into(&mut reader),
                    })
                } else {
                    None
                };
                children.push(DecodedChild {
                    key,
                    addr: RefAddr { addr, ta },
                    fast_del,
                });
            }
            Ok(DecodedPage::Internal { header, children })
        }
        _ => Err(Error::corruption("unknown page image type")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_leaf_image_round_trip() {
        let mut tw = TimeWindow::default();
        tw.start_ts = 10;
        tw.durable_start_ts = 10;
        tw.start_txn = 3;

        let slots = vec![
            RowSlot {
                key: b"apple".to_vec(),
                value: Bytes::from_static(b"1"),
                tw: tw.clone(),
            },
            RowSlot {
                key: b"pear".to_vec(),
                value: Bytes::from_static(b"2"),
                tw,
            },
        ];

        let image = encode_row_leaf(7, 1024, &slots, true);
        match decode(&image).unwrap() {
            DecodedPage::RowLeaf { header, slots: out } => {
                assert_eq!(header.write_gen, 7);
                assert_eq!(header.entries, 2);
                assert_ne!(header.flags & IMG_HS_UPDATE, 0);
                assert_ne!(header.flags & IMG_EMPTY_V_NONE, 0);
                assert_eq!(out.len(), 2);
                assert_eq!(out[0].key, b"apple");
                assert_eq!(out[0].value, Bytes::from_static(b"1"));
                assert_eq!(out[0].tw.start_ts, 10);
            }
            _ => panic!("decoded the wrong page type"),
        }
    }

    #[test]
    fn test_col_fix_image_round_trip() {
        let image = encode_col_fix_leaf(1, 64, 5, 8, &[0x7, 0x0, 0x1]);
        match decode(&image).unwrap() {
            DecodedPage::ColFixLeaf {
                start_recno,
                bit_width,
                values,
                ..
            } => {
                assert_eq!(start_recno, 5);
                assert_eq!(bit_width, 8);
                assert_eq!(values, vec![0x7, 0x0, 0x1]);
            }
            _ => panic!("decoded the wrong page type"),
        }
    }

    #[test]
    fn test_internal_image_round_trip() {
        let children = vec![
            (
                RefKey::Row(vec![]),
                RefAddr {
                    addr: Bytes::from_static(b"addr-1"),
                    ta: TimeAggregate::default(),
                },
                None,
            ),
            (
                RefKey::Row(b"m".to_vec()),
                RefAddr {
                    addr: Bytes::from_static(b"addr-2"),
                    ta: TimeAggregate::default(),
                },
                Some(FastDelete {
                    txn_id: 9,
                    ts: 5,
                    durable_ts: 5,
                }),
            ),
        ];
        let image = encode_internal(3, 512, &children);
        match decode(&image).unwrap() {
            DecodedPage::Internal { children: out, .. } => {
                assert_eq!(out.len(), 2);
                assert_eq!(out[0].key, RefKey::Row(vec![]));
                assert!(out[0].fast_del.is_none());
                let del = out[1].fast_del.as_ref().unwrap();
                assert_eq!(del.txn_id, 9);
            }
            _ => panic!("decoded the wrong page type"),
        }
    }

    #[test]
    fn test_truncated_image_is_corruption() {
        assert!(decode(&[0u8; 10]).is_err());
    }
}
