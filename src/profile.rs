//! 转码画质预设目录

use serde::Serialize;
use std::fmt;

/// 目标分辨率
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// 保持源分辨率 (不转码)
    Source,
    Fixed { width: u32, height: u32 },
}

/// 画质预设 (不可变，启动时加载一次)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscodeProfile {
    pub id: &'static str,
    pub resolution: Resolution,
    /// 视频码率 (kbps)，`auto` 为 None 表示直接拷贝
    pub video_bitrate_kbps: Option<u32>,
    /// 音频码率 (kbps)
    pub audio_bitrate_kbps: Option<u32>,
    pub fps: Option<u32>,
}

pub const AUTO: TranscodeProfile = TranscodeProfile {
    id: "auto",
    resolution: Resolution::Source,
    video_bitrate_kbps: None,
    audio_bitrate_kbps: None,
    fps: None,
};

const CATALOG: [TranscodeProfile; 4] = [
    AUTO,
    TranscodeProfile {
        id: "480p",
        resolution: Resolution::Fixed { width: 854, height: 480 },
        video_bitrate_kbps: Some(1500),
        audio_bitrate_kbps: Some(128),
        fps: Some(30),
    },
    TranscodeProfile {
        id: "720p",
        resolution: Resolution::Fixed { width: 1280, height: 720 },
        video_bitrate_kbps: Some(3000),
        audio_bitrate_kbps: Some(128),
        fps: Some(30),
    },
    TranscodeProfile {
        id: "1080p",
        resolution: Resolution::Fixed { width: 1920, height: 1080 },
        video_bitrate_kbps: Some(5000),
        audio_bitrate_kbps: Some(128),
        fps: Some(30),
    },
];

/// 按标识查找预设。未知或空标识回落到 `auto`，不会失败。
pub fn resolve(identifier: &str) -> TranscodeProfile {
    let wanted = identifier.trim();
    CATALOG
        .iter()
        .find(|p| p.id.eq_ignore_ascii_case(wanted))
        .cloned()
        .unwrap_or(AUTO)
}

/// 标识是否在目录中 (CLI 用来提示拼写错误)
pub fn is_known(identifier: &str) -> bool {
    CATALOG
        .iter()
        .any(|p| p.id.eq_ignore_ascii_case(identifier.trim()))
}

pub fn all() -> &'static [TranscodeProfile] {
    &CATALOG
}

impl TranscodeProfile {
    pub fn is_copy(&self) -> bool {
        self.video_bitrate_kbps.is_none()
    }

    /// 由预设生成的视频编码参数
    pub fn video_args(&self) -> Vec<String> {
        let (Resolution::Fixed { width, height }, Some(kbps)) =
            (self.resolution, self.video_bitrate_kbps)
        else {
            return vec!["-c:v".into(), "copy".into()];
        };
        let fps = self.fps.unwrap_or(30);

        [
            "-c:v",
            "libx264",
            "-preset",
            "ultrafast",
            "-tune",
            "zerolatency",
        ]
        .iter()
        .map(|s| s.to_string())
        .chain([
            "-vf".into(),
            format!("scale={}:{}", width, height),
            "-b:v".into(),
            format!("{}k", kbps),
            "-maxrate".into(),
            format!("{}k", kbps),
            "-bufsize".into(),
            format!("{}k", kbps * 2),
            "-r".into(),
            fps.to_string(),
            // 每 2 秒一个关键帧
            "-g".into(),
            (fps * 2).to_string(),
            "-pix_fmt".into(),
            "yuv420p".into(),
        ])
        .collect()
    }

    /// 由预设生成的音频编码参数
    pub fn audio_args(&self) -> Vec<String> {
        match self.audio_bitrate_kbps {
            Some(kbps) => vec![
                "-c:a".into(),
                "aac".into(),
                "-b:a".into(),
                format!("{}k", kbps),
                "-ar".into(),
                "48000".into(),
                "-ac".into(),
                "2".into(),
            ],
            None => vec!["-c:a".into(), "copy".into()],
        }
    }
}

impl fmt::Display for TranscodeProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.resolution, self.video_bitrate_kbps) {
            (Resolution::Fixed { width, height }, Some(kbps)) => {
                write!(f, "{} ({}x{}, {}k)", self.id, width, height, kbps)
            }
            _ => write!(f, "{} (copy source)", self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_and_empty_identifiers_default_to_auto() {
        assert_eq!(resolve("bogus"), AUTO);
        assert_eq!(resolve(""), AUTO);
        assert_eq!(resolve("   "), AUTO);
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let p = resolve("720P");
        assert_eq!(p.id, "720p");
        assert_eq!(p.resolution, Resolution::Fixed { width: 1280, height: 720 });
        assert_eq!(p.video_bitrate_kbps, Some(3000));
    }

    #[test]
    fn auto_copies_both_streams() {
        assert!(AUTO.is_copy());
        assert_eq!(AUTO.video_args(), vec!["-c:v", "copy"]);
        assert_eq!(AUTO.audio_args(), vec!["-c:a", "copy"]);
    }

    #[test]
    fn fixed_profile_args_carry_scale_and_bitrates() {
        let args = resolve("480p").video_args();
        let joined = args.join(" ");
        assert!(joined.contains("scale=854:480"));
        assert!(joined.contains("-b:v 1500k"));
        assert!(joined.contains("-bufsize 3000k"));
        assert!(joined.contains("-g 60"));

        let audio = resolve("1080p").audio_args().join(" ");
        assert_eq!(audio, "-c:a aac -b:a 128k -ar 48000 -ac 2");
    }

    #[test]
    fn known_identifiers() {
        assert!(is_known("1080p"));
        assert!(!is_known("4k"));
        assert_eq!(all().len(), 4);
    }
}
