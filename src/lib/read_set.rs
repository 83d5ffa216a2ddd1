use seq_io::fastq::OwnedRecord;
use seq_io::fastq::write_to;

/// Tag appended to the description line of records routed to a sentinel file.
const REASON_TAG: &[u8] = b" gx:reason=";

/// One logical unit of demultiplexing: a single read, or a read plus its mate
/// consumed in lockstep from a second stream.
#[derive(Debug, Clone)]
pub struct ReadUnit {
    /// the read carrying the inline barcode and cut-site remnant
    pub r1: OwnedRecord,
    /// the mate, when running paired-end
    pub r2: Option<OwnedRecord>,
}

/// A unit rendered to raw FASTQ bytes, ready to be appended to output streams.
#[derive(Debug, Clone)]
pub struct SerializedUnit {
    /// bytes destined for the mate-1 stream of the target
    pub r1: Vec<u8>,
    /// bytes destined for the mate-2 stream of the target, when paired
    pub r2: Option<Vec<u8>>,
}

/// Returns the portion of a FASTQ header before the first space or '/', which
/// mates of one template share.
#[must_use]
pub fn header_stem(head: &[u8]) -> &[u8] {
    let end = head.iter().position(|&b| b == b' ' || b == b'/').unwrap_or(head.len());
    &head[..end]
}

impl ReadUnit {
    /// True when this unit carries a mate.
    #[must_use]
    pub fn is_paired(&self) -> bool {
        self.r2.is_some()
    }

    /// True when the mate headers agree on their stem (trivially true unpaired).
    #[must_use]
    pub fn mates_agree(&self) -> bool {
        match &self.r2 {
            Some(r2) => header_stem(&self.r1.head) == header_stem(&r2.head),
            None => true,
        }
    }

    /// Renders the unit with the leading `trim` bases (and quality values)
    /// removed from mate 1.  The mate, which carries no inline barcode, is
    /// rendered whole.
    ///
    /// # Panics
    /// Panics if mate 1 does not extend past `trim` bases; the classifier
    /// guarantees this for matched reads.
    #[must_use]
    pub fn serialize_trimmed(&self, trim: usize) -> SerializedUnit {
        assert!(self.r1.seq.len() > trim, "Cannot trim a read down to an empty body");
        let r1 = record_bytes(&self.r1.head, &self.r1.seq[trim..], &self.r1.qual[trim..]);
        let r2 = self.r2.as_ref().map(|r| record_bytes(&r.head, &r.seq, &r.qual));
        SerializedUnit { r1, r2 }
    }

    /// Renders the unit verbatim, untrimmed.
    #[must_use]
    pub fn serialize_verbatim(&self) -> SerializedUnit {
        let r1 = record_bytes(&self.r1.head, &self.r1.seq, &self.r1.qual);
        let r2 = self.r2.as_ref().map(|r| record_bytes(&r.head, &r.seq, &r.qual));
        SerializedUnit { r1, r2 }
    }

    /// Renders the unit verbatim with a ` gx:reason=<reason>` tag appended to
    /// each header, so sentinel files record why a read landed there.
    #[must_use]
    pub fn serialize_tagged(&self, reason: &str) -> SerializedUnit {
        let r1 = record_bytes(&tagged_head(&self.r1.head, reason), &self.r1.seq, &self.r1.qual);
        let r2 = self
            .r2
            .as_ref()
            .map(|r| record_bytes(&tagged_head(&r.head, reason), &r.seq, &r.qual));
        SerializedUnit { r1, r2 }
    }
}

fn tagged_head(head: &[u8], reason: &str) -> Vec<u8> {
    let mut tagged = Vec::with_capacity(head.len() + REASON_TAG.len() + reason.len());
    tagged.extend_from_slice(head);
    tagged.extend_from_slice(REASON_TAG);
    tagged.extend_from_slice(reason.as_bytes());
    tagged
}

fn record_bytes(head: &[u8], seq: &[u8], qual: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(head.len() + seq.len() + qual.len() + 6);
    write_to(&mut buf, head, seq, qual).expect("writing a FASTQ record to memory cannot fail");
    buf
}
