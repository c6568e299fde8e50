//! Session and media descriptions

use std::net::IpAddr;

use crate::error::{SdpError, SdpResult};
use crate::range::PlayRange;

/// Codec mapping from an `a=rtpmap` attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpMap {
    pub payload_type: u8,
    pub encoding: String,
    pub clock_rate: u32,
    pub channels: u16,
}

impl RtpMap {
    /// Parses the value of an `a=rtpmap:` attribute, e.g. `97 L16/44100/2`
    fn parse(value: &str) -> Result<Self, String> {
        let (payload, mapping) = value
            .trim()
            .split_once(' ')
            .ok_or_else(|| format!("missing encoding in {value:?}"))?;
        let payload_type = payload
            .parse::<u8>()
            .map_err(|_| format!("invalid payload type {payload:?}"))?;

        let mut parts = mapping.trim().split('/');
        let encoding = parts
            .next()
            .filter(|e| !e.is_empty())
            .ok_or_else(|| format!("missing encoding name in {value:?}"))?
            .to_string();
        let clock_rate = parts
            .next()
            .ok_or_else(|| format!("missing clock rate in {value:?}"))?
            .parse::<u32>()
            .map_err(|_| format!("invalid clock rate in {value:?}"))?;
        let channels = match parts.next() {
            Some(channels) => channels
                .parse::<u16>()
                .map_err(|_| format!("invalid channel count in {value:?}"))?,
            None => 1,
        };

        Ok(Self {
            payload_type,
            encoding,
            clock_rate,
            channels,
        })
    }

    /// Well-known mappings for static payload types
    fn for_static_payload(payload_type: u8) -> Option<Self> {
        let (encoding, clock_rate, channels) = match payload_type {
            0 => ("PCMU", 8000, 1),
            8 => ("PCMA", 8000, 1),
            10 => ("L16", 44100, 2),
            11 => ("L16", 44100, 1),
            14 => ("MPA", 90000, 1),
            _ => return None,
        };
        Some(Self {
            payload_type,
            encoding: encoding.to_string(),
            clock_rate,
            channels,
        })
    }
}

/// One `m=` section of a description: a substream the listener may set up
#[derive(Debug, Clone, PartialEq)]
pub struct MediaDescription {
    medium: String,
    port: u16,
    protocol: String,
    formats: Vec<u8>,
    rtpmap: Option<RtpMap>,
    control: Option<String>,
    range: Option<PlayRange>,
    rtcp_mux: bool,
}

impl MediaDescription {
    fn parse(line: usize, value: &str) -> SdpResult<Self> {
        let invalid = |reason: String| SdpError::InvalidMedia { line, reason };
        let mut fields = value.split_whitespace();

        let medium = fields
            .next()
            .ok_or_else(|| invalid("missing media type".to_string()))?
            .to_string();
        let port_field = fields
            .next()
            .ok_or_else(|| invalid("missing port".to_string()))?;
        // "<port>/<count>" is allowed; only the base port matters here
        let port = port_field
            .split('/')
            .next()
            .unwrap_or_default()
            .parse::<u16>()
            .map_err(|_| invalid(format!("invalid port {port_field:?}")))?;
        let protocol = fields
            .next()
            .ok_or_else(|| invalid("missing transport protocol".to_string()))?
            .to_string();
        let formats = fields
            .map(|f| {
                f.parse::<u8>()
                    .map_err(|_| invalid(format!("invalid payload format {f:?}")))
            })
            .collect::<SdpResult<Vec<u8>>>()?;

        Ok(Self {
            medium,
            port,
            protocol,
            formats,
            rtpmap: None,
            control: None,
            range: None,
            rtcp_mux: false,
        })
    }

    /// Media type, e.g. `audio`
    pub fn medium_name(&self) -> &str {
        &self.medium
    }

    /// Codec name from the rtpmap, or the static payload mapping, or `unknown`
    pub fn codec_name(&self) -> &str {
        self.rtpmap
            .as_ref()
            .map(|m| m.encoding.as_str())
            .unwrap_or("unknown")
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn formats(&self) -> &[u8] {
        &self.formats
    }

    pub fn rtpmap(&self) -> Option<&RtpMap> {
        self.rtpmap.as_ref()
    }

    /// The `a=control` URL, relative or absolute, used to address this substream
    pub fn control(&self) -> Option<&str> {
        self.control.as_deref()
    }

    pub fn range(&self) -> Option<PlayRange> {
        self.range
    }

    /// Whether RTP and RTCP share a single port
    pub fn rtcp_is_muxed(&self) -> bool {
        self.rtcp_mux
    }

    /// Sample width in bits for linear and companded PCM codecs
    pub fn sample_width_bits(&self) -> Option<u16> {
        match self.codec_name().to_ascii_uppercase().as_str() {
            "L8" | "PCMU" | "PCMA" => Some(8),
            "L16" => Some(16),
            "L20" => Some(20),
            "L24" => Some(24),
            _ => None,
        }
    }

    /// `audio/L16` style label used in log output
    pub fn label(&self) -> String {
        format!("{}/{}", self.medium, self.codec_name())
    }

    fn apply_attribute(&mut self, line: usize, name: &str, value: Option<&str>) -> SdpResult<()> {
        match (name, value) {
            ("rtpmap", Some(value)) => {
                let map = RtpMap::parse(value)
                    .map_err(|reason| SdpError::InvalidRtpMap { line, reason })?;
                if self.formats.is_empty() || self.formats.contains(&map.payload_type) {
                    // First mapping wins, matching the preferred format order
                    if self.rtpmap.is_none() {
                        self.rtpmap = Some(map);
                    }
                }
            }
            ("control", Some(value)) => self.control = Some(value.trim().to_string()),
            ("range", Some(value)) => {
                self.range = Some(
                    PlayRange::parse_value(value)
                        .map_err(|reason| SdpError::InvalidRange { line, reason })?,
                );
            }
            ("rtcp-mux", None) => self.rtcp_mux = true,
            _ => {}
        }
        Ok(())
    }

    fn finish(&mut self) {
        if self.rtpmap.is_none() {
            self.rtpmap = self
                .formats
                .first()
                .and_then(|pt| RtpMap::for_static_payload(*pt));
        }
    }
}

/// A parsed session description
#[derive(Debug, Clone, PartialEq)]
pub struct SessionDescription {
    name: Option<String>,
    connection: Option<IpAddr>,
    control: Option<String>,
    range: Option<PlayRange>,
    media: Vec<MediaDescription>,
}

impl SessionDescription {
    /// Parse a description.
    ///
    /// Lines may end with `\r\n` or `\n`. Unknown line types and attributes are ignored.
    pub fn parse(text: &str) -> SdpResult<Self> {
        let mut lines = text
            .lines()
            .enumerate()
            .map(|(i, l)| (i + 1, l.trim_end()))
            .filter(|(_, l)| !l.is_empty());

        match lines.next() {
            Some((_, "v=0")) => {}
            Some((_, line)) if line.starts_with("v=") => {
                return Err(SdpError::UnsupportedVersion(line[2..].to_string()))
            }
            _ => return Err(SdpError::MissingVersion),
        }

        let mut description = Self {
            name: None,
            connection: None,
            control: None,
            range: None,
            media: Vec::new(),
        };

        for (line_no, line) in lines {
            let (kind, value) = line
                .split_once('=')
                .filter(|(kind, _)| kind.len() == 1)
                .ok_or_else(|| SdpError::MalformedLine {
                    line: line_no,
                    content: line.to_string(),
                })?;

            match kind {
                "m" => {
                    if let Some(previous) = description.media.last_mut() {
                        previous.finish();
                    }
                    description
                        .media
                        .push(MediaDescription::parse(line_no, value)?);
                }
                "a" => {
                    let (name, attr_value) = match value.split_once(':') {
                        Some((name, v)) => (name, Some(v)),
                        None => (value, None),
                    };
                    match description.media.last_mut() {
                        Some(media) => media.apply_attribute(line_no, name, attr_value)?,
                        None => description.apply_attribute(line_no, name, attr_value)?,
                    }
                }
                "s" if description.media.is_empty() => {
                    description.name = Some(value.to_string());
                }
                "c" if description.media.is_empty() => {
                    // c=IN IP4 10.0.0.5[/ttl]
                    description.connection = value
                        .split_whitespace()
                        .nth(2)
                        .and_then(|addr| addr.split('/').next())
                        .and_then(|addr| addr.parse().ok());
                }
                _ => {}
            }
        }

        if let Some(last) = description.media.last_mut() {
            last.finish();
        }

        Ok(description)
    }

    fn apply_attribute(&mut self, line: usize, name: &str, value: Option<&str>) -> SdpResult<()> {
        match (name, value) {
            ("control", Some(value)) => self.control = Some(value.trim().to_string()),
            ("range", Some(value)) => {
                self.range = Some(
                    PlayRange::parse_value(value)
                        .map_err(|reason| SdpError::InvalidRange { line, reason })?,
                );
            }
            _ => {}
        }
        Ok(())
    }

    /// Session name (`s=`)
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Session-level connection address (`c=`)
    pub fn connection(&self) -> Option<IpAddr> {
        self.connection
    }

    /// Session-level aggregate control URL
    pub fn control(&self) -> Option<&str> {
        self.control.as_deref()
    }

    pub fn media(&self) -> &[MediaDescription] {
        &self.media
    }

    pub fn has_media(&self) -> bool {
        !self.media.is_empty()
    }

    /// The absolute (`clock=`) range, if the stream is indexed by wall-clock time
    pub fn absolute_range(&self) -> Option<PlayRange> {
        self.ranges().find(PlayRange::is_absolute)
    }

    /// Earliest relative start time over the session and its media
    pub fn play_start_time(&self) -> f64 {
        self.ranges()
            .filter_map(|r| match r {
                PlayRange::Npt { start, .. } => Some(start),
                PlayRange::Clock { .. } => None,
            })
            .reduce(f64::min)
            .unwrap_or(0.0)
    }

    /// Latest relative end time over the session and its media; `0.0` when open-ended
    pub fn play_end_time(&self) -> f64 {
        self.ranges()
            .filter_map(|r| match r {
                PlayRange::Npt { end, .. } => end,
                PlayRange::Clock { .. } => None,
            })
            .reduce(f64::max)
            .unwrap_or(0.0)
    }

    /// Window to request when asking the remote side to play
    pub fn play_window(&self) -> PlayRange {
        self.absolute_range().unwrap_or_else(PlayRange::full)
    }

    /// Expected stream length in seconds, `<= 0.0` for live or unbounded streams
    pub fn expected_duration(&self) -> f64 {
        match self.absolute_range() {
            Some(range) => range.duration(),
            None => {
                let end = self.play_end_time();
                if end > 0.0 {
                    end - self.play_start_time()
                } else {
                    0.0
                }
            }
        }
    }

    fn ranges(&self) -> impl Iterator<Item = PlayRange> + '_ {
        self.range
            .into_iter()
            .chain(self.media.iter().filter_map(|m| m.range))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const TWO_TRACKS: &str = "v=0\r\n\
        o=- 1 1 IN IP4 10.0.0.5\r\n\
        s=MicBridge\r\n\
        c=IN IP4 10.0.0.5\r\n\
        t=0 0\r\n\
        a=control:*\r\n\
        a=range:npt=0-42\r\n\
        m=audio 0 RTP/AVP 97\r\n\
        a=rtpmap:97 L16/48000/2\r\n\
        a=control:trackID=1\r\n\
        a=rtcp-mux\r\n\
        m=audio 0 RTP/AVP 0\r\n\
        a=control:trackID=2\r\n";

    #[test]
    fn test_parse_two_tracks() {
        let description = SessionDescription::parse(TWO_TRACKS).unwrap();
        assert_eq!(description.name(), Some("MicBridge"));
        assert_eq!(description.connection(), Some("10.0.0.5".parse().unwrap()));
        assert_eq!(description.control(), Some("*"));
        assert_eq!(description.media().len(), 2);

        let first = &description.media()[0];
        assert_eq!(first.label(), "audio/L16");
        assert_eq!(first.control(), Some("trackID=1"));
        assert!(first.rtcp_is_muxed());
        assert_eq!(first.sample_width_bits(), Some(16));
        assert_eq!(first.rtpmap().unwrap().channels, 2);

        let second = &description.media()[1];
        assert_eq!(second.codec_name(), "PCMU");
        assert!(!second.rtcp_is_muxed());
        assert_eq!(second.sample_width_bits(), Some(8));
    }

    #[test]
    fn test_relative_duration() {
        let description = SessionDescription::parse(TWO_TRACKS).unwrap();
        assert_eq!(description.expected_duration(), 42.0);
        assert_eq!(description.play_window(), PlayRange::full());
    }

    #[test]
    fn test_absolute_duration() {
        let sdp = "v=0\na=range:clock=20240101T120000Z-20240101T120030Z\nm=audio 0 RTP/AVP 11\n";
        let description = SessionDescription::parse(sdp).unwrap();
        assert!(description.play_window().is_absolute());
        assert_eq!(description.expected_duration(), 30.0);
    }

    #[test]
    fn test_media_level_ranges() {
        let sdp = "v=0\n\
            m=audio 0 RTP/AVP 10\na=range:npt=5-20\n\
            m=audio 0 RTP/AVP 10\na=range:npt=0-15\n";
        let description = SessionDescription::parse(sdp).unwrap();
        assert_eq!(description.play_start_time(), 0.0);
        assert_eq!(description.play_end_time(), 20.0);
        assert_eq!(description.expected_duration(), 20.0);
    }

    #[rstest]
    #[case("v=0\nm=audio 0 RTP/AVP 97\na=range:npt=0-\n")]
    #[case("v=0\nm=audio 0 RTP/AVP 97\n")]
    fn test_live_stream_has_no_duration(#[case] sdp: &str) {
        let description = SessionDescription::parse(sdp).unwrap();
        assert_eq!(description.expected_duration(), 0.0);
    }

    #[test]
    fn test_no_media() {
        let description = SessionDescription::parse("v=0\ns=empty\n").unwrap();
        assert!(!description.has_media());
    }

    #[rstest]
    #[case("", SdpError::MissingVersion)]
    #[case("s=no version\n", SdpError::MissingVersion)]
    #[case("v=1\n", SdpError::UnsupportedVersion("1".to_string()))]
    fn test_version_errors(#[case] sdp: &str, #[case] expected: SdpError) {
        assert_eq!(SessionDescription::parse(sdp).unwrap_err(), expected);
    }

    #[test]
    fn test_malformed_lines_report_line_number() {
        let err = SessionDescription::parse("v=0\nnot a line\n").unwrap_err();
        assert!(matches!(err, SdpError::MalformedLine { line: 2, .. }));

        let err = SessionDescription::parse("v=0\nm=audio x RTP/AVP 0\n").unwrap_err();
        assert!(matches!(err, SdpError::InvalidMedia { line: 2, .. }));

        let err = SessionDescription::parse("v=0\nm=audio 0 RTP/AVP 97\na=rtpmap:97 L16\n")
            .unwrap_err();
        assert!(matches!(err, SdpError::InvalidRtpMap { line: 3, .. }));
    }

    #[test]
    fn test_unknown_payload_type_has_unknown_codec() {
        let description = SessionDescription::parse("v=0\nm=audio 0 RTP/AVP 120\n").unwrap();
        assert_eq!(description.media()[0].codec_name(), "unknown");
        assert_eq!(description.media()[0].sample_width_bits(), None);
    }
}
