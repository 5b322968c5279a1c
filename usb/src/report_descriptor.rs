use ups_hid_types::ReportType;

const LONG_ITEM_PREFIX: u8 = 0xFE;

const ITEM_TYPE_MAIN: u8 = 0;
const ITEM_TYPE_GLOBAL: u8 = 1;

// Main item tags
const TAG_INPUT: u8 = 0x8;
const TAG_OUTPUT: u8 = 0x9;
const TAG_FEATURE: u8 = 0xB;

// Global item tags
const TAG_REPORT_ID: u8 = 0x8;
const TAG_PUSH: u8 = 0xA;
const TAG_POP: u8 = 0xB;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ShortItem<'a> {
    pub item_type: u8,
    pub tag: u8,
    pub data: &'a [u8],
}

impl ShortItem<'_> {
    pub fn value(&self) -> u32 {
        self.data
            .iter()
            .rev()
            .fold(0, |value, byte| (value << 8) | *byte as u32)
    }
}

/// Iterates the short items of a report descriptor, skipping long items. Stops at the first item
/// whose data would run past the end of the buffer.
pub struct ReportItems<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> ReportItems<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }
}

impl<'a> Iterator for ReportItems<'a> {
    type Item = ShortItem<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let remaining = self.buffer.get(self.position..)?;
            let prefix = *remaining.first()?;

            if prefix == LONG_ITEM_PREFIX {
                let size = *remaining.get(1)? as usize;
                if remaining.len() < 3 + size {
                    self.position = self.buffer.len();
                    return None;
                }
                self.position += 3 + size;
                continue;
            }

            let size = match prefix & 0x03 {
                3 => 4,
                size => size as usize,
            };
            if remaining.len() < 1 + size {
                self.position = self.buffer.len();
                return None;
            }

            self.position += 1 + size;
            return Some(ShortItem {
                item_type: (prefix >> 2) & 0x03,
                tag: prefix >> 4,
                data: &remaining[1..1 + size],
            });
        }
    }
}

/// Lists the report IDs a descriptor declares for reports of the given type, in ascending order.
pub fn declared_report_ids(descriptor: &[u8], report_type: ReportType) -> Vec<u8> {
    let wanted = match report_type {
        ReportType::Input => TAG_INPUT,
        ReportType::Output => TAG_OUTPUT,
        ReportType::Feature => TAG_FEATURE,
    };

    let mut stack: Vec<u8> = Vec::new();
    let mut current = 0;
    let mut ids: Vec<u8> = Vec::new();

    for item in ReportItems::new(descriptor) {
        match (item.item_type, item.tag) {
            (ITEM_TYPE_GLOBAL, TAG_REPORT_ID) => current = item.value() as u8,
            (ITEM_TYPE_GLOBAL, TAG_PUSH) => stack.push(current),
            (ITEM_TYPE_GLOBAL, TAG_POP) => current = stack.pop().unwrap_or(current),
            (ITEM_TYPE_MAIN, tag) if tag == wanted && current != 0 => {
                if !ids.contains(&current) {
                    ids.push(current);
                }
            }
            _ => {}
        }
    }

    ids.sort_unstable();
    ids
}

/// Formats bytes as space separated upper case hex.
pub fn hex_string(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Splits bytes into lines of 16 for logging.
pub fn hex_lines(bytes: &[u8]) -> Vec<String> {
    bytes.chunks(16).map(hex_string).collect()
}
