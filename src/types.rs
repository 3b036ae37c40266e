use serde::{Deserialize, Serialize};

/// 判定の閾値（確率がこの値以上なら Dirty）
pub const DECISION_THRESHOLD: f64 = 0.5;

/// 水質ラベル
///
/// インデックスはクラスフォルダ名の辞書順で決まります（0 = Clean, 1 = Dirty）。
/// フォルダ名を変えると対応が変わるため、学習時の対応表はモデルに保存されます。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WaterLabel {
    Clean,
    Dirty,
}

impl WaterLabel {
    pub const ALL: [WaterLabel; 2] = [WaterLabel::Clean, WaterLabel::Dirty];

    pub fn index(self) -> usize {
        match self {
            WaterLabel::Clean => 0,
            WaterLabel::Dirty => 1,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(WaterLabel::Clean),
            1 => Some(WaterLabel::Dirty),
            _ => None,
        }
    }

    /// 確率を閾値で二値化（0.5ちょうどは Dirty）
    pub fn from_probability(probability: f64) -> Self {
        if probability >= DECISION_THRESHOLD {
            WaterLabel::Dirty
        } else {
            WaterLabel::Clean
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WaterLabel::Clean => "Clean",
            WaterLabel::Dirty => "Dirty",
        }
    }
}

impl std::fmt::Display for WaterLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 推論結果（フロントエンドへの境界）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    /// Dirty である確率 [0, 1]
    pub probability: f64,
    pub label: WaterLabel,
    /// 選んだラベルに対する確信度 [50, 100]
    pub confidence: f64,
}

impl PredictionResult {
    pub fn from_probability(probability: f64) -> Self {
        let probability = probability.clamp(0.0, 1.0);
        let label = WaterLabel::from_probability(probability);
        Self {
            probability,
            label,
            confidence: confidence_for(probability),
        }
    }
}

/// 選んだラベルに対する確信度（%）
pub fn confidence_for(probability: f64) -> f64 {
    if probability >= DECISION_THRESHOLD {
        probability * 100.0
    } else {
        (1.0 - probability) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_boundary_is_dirty() {
        let result = PredictionResult::from_probability(0.5);
        assert_eq!(result.label, WaterLabel::Dirty);
        assert_eq!(result.confidence, 50.0);
    }

    #[test]
    fn test_confidence_range() {
        for step in 0..=1000 {
            let p = step as f64 / 1000.0;
            let c = confidence_for(p);
            assert!((50.0..=100.0).contains(&c), "p={} c={}", p, c);
            if c == 100.0 {
                assert!(p == 0.0 || p == 1.0, "p={}", p);
            }
        }
    }

    #[test]
    fn test_confidence_tracks_chosen_label() {
        let clean = PredictionResult::from_probability(0.2);
        assert_eq!(clean.label, WaterLabel::Clean);
        assert!((clean.confidence - 80.0).abs() < 1e-9);

        let dirty = PredictionResult::from_probability(0.9);
        assert_eq!(dirty.label, WaterLabel::Dirty);
        assert!((dirty.confidence - 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_label_serializes_as_name() {
        let json = serde_json::to_string(&PredictionResult::from_probability(1.0)).unwrap();
        assert!(json.contains("\"label\":\"Dirty\""));
        assert!(json.contains("\"confidence\":100.0"));
    }
}
