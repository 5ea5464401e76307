use kioku_core::model::{ClozeExample, Unit, UnitError, UnitId, UnitKind};

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| (*v).to_owned()).collect()
}

/// Small level 1-2 curriculum for trying the binary out.
pub fn sample_units() -> Result<Vec<Unit>, UnitError> {
    Ok(vec![
        Unit::new(
            UnitId::new(1),
            1,
            "一",
            UnitKind::Radical {
                meanings: strings(&["ground", "one"]),
            },
        )?,
        Unit::new(
            UnitId::new(2),
            1,
            "口",
            UnitKind::Radical {
                meanings: strings(&["mouth"]),
            },
        )?,
        Unit::new(
            UnitId::new(3),
            1,
            "人",
            UnitKind::Kanji {
                meanings: strings(&["person"]),
                onyomi: strings(&["じん", "にん"]),
                kunyomi: strings(&["ひと"]),
            },
        )?,
        Unit::new(
            UnitId::new(4),
            1,
            "水",
            UnitKind::Kanji {
                meanings: strings(&["water"]),
                onyomi: strings(&["すい"]),
                kunyomi: strings(&["みず"]),
            },
        )?,
        Unit::new(
            UnitId::new(5),
            1,
            "大人",
            UnitKind::Vocabulary {
                meanings: strings(&["adult", "grown-up"]),
                readings: strings(&["おとな"]),
            },
        )?,
        Unit::new(
            UnitId::new(6),
            1,
            "〜です",
            UnitKind::Grammar {
                meanings: strings(&["to be (polite)"]),
                pattern: "N + です".into(),
                examples: vec![
                    ClozeExample {
                        sentence: "学生です。".into(),
                        answer: "です".into(),
                        translation: Some("I am a student.".into()),
                    },
                    ClozeExample {
                        sentence: "水です。".into(),
                        answer: "です".into(),
                        translation: Some("It is water.".into()),
                    },
                ],
            },
        )?,
        Unit::new(
            UnitId::new(7),
            2,
            "山",
            UnitKind::Kanji {
                meanings: strings(&["mountain"]),
                onyomi: strings(&["さん"]),
                kunyomi: strings(&["やま"]),
            },
        )?,
        Unit::new(
            UnitId::new(8),
            2,
            "〜ている",
            UnitKind::Grammar {
                meanings: strings(&["ongoing action"]),
                pattern: "Vて + いる".into(),
                examples: vec![ClozeExample {
                    sentence: "本を読んでいる。".into(),
                    answer: "読んでいる".into(),
                    translation: Some("I am reading a book.".into()),
                }],
            },
        )?,
    ])
}
