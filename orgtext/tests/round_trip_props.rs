//! Property-based round-trip tests.

use orgtext::{export, parse, query_inherited_flag, tokenize};
use proptest::prelude::*;

/// Lines that exercise every line kind, in canonical spelling.
fn org_line_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("* Heading".to_string()),
        Just("** TODO [#B] Task   :tag:other:".to_string()),
        Just("*** DONE Closed task ".to_string()),
        Just("SCHEDULED: <2019-07-30 Tue>".to_string()),
        Just("  SCHEDULED: <2019-07-30 Tue 09:00 +1w> DEADLINE: <2019-08-01 Thu -2d>".to_string()),
        Just("CLOSED: [2019-07-31 Wed 10:00]".to_string()),
        Just(":PROPERTIES:".to_string()),
        Just(":ID:       abc".to_string()),
        Just(":LOGGING: nologrepeat".to_string()),
        Just(":END:".to_string()),
        Just(":LOGBOOK:".to_string()),
        Just("CLOCK: [2019-07-30 Tue 09:00]--[2019-07-30 Tue 10:00] =>  1:00".to_string()),
        Just("CLOCK: [2019-07-30 Tue 09:00]".to_string()),
        Just("- State \"DONE\" from \"TODO\" [2019-07-30 Tue 10:00]".to_string()),
        Just("#+STARTUP: nologrepeat".to_string()),
        Just("#+TODO: TODO NEXT | DONE".to_string()),
        Just(String::new()),
        Just("   ".to_string()),
        "[a-zA-Z0-9 *=/_~+:.\\[\\]-]{0,40}",
    ]
}

fn org_document_strategy() -> impl Strategy<Value = String> {
    (prop::collection::vec(org_line_strategy(), 0..40), any::<bool>()).prop_map(
        |(lines, final_newline)| {
            let mut text = lines.join("\n");
            if final_newline && !lines.is_empty() {
                text.push('\n');
            }
            text
        },
    )
}

/// Fragments that collide with each other when concatenated.
fn markup_line_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec(
        prop_oneof![
            Just("*".to_string()),
            Just("/".to_string()),
            Just("=".to_string()),
            Just("~".to_string()),
            Just(" ".to_string()),
            Just(";".to_string()),
            Just("http://example.com/a=b/".to_string()),
            Just("[[target][desc]]".to_string()),
            Just("[[".to_string()),
            Just("[1/2]".to_string()),
            Just("[%]".to_string()),
            Just("+15551234567".to_string()),
            Just("me@example.org".to_string()),
            "[a-z]{1,5}",
        ],
        0..24,
    )
    .prop_map(|parts| parts.concat())
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        .. ProptestConfig::default()
    })]

    #[test]
    fn spans_cover_arbitrary_lines(line in "\\PC{0,80}") {
        let rebuilt: String = tokenize(&line).iter().map(ToString::to_string).collect();
        prop_assert_eq!(rebuilt, line);
    }

    #[test]
    fn spans_cover_markup_collisions(line in markup_line_strategy()) {
        let spans = tokenize(&line);
        let rebuilt: String = spans.iter().map(ToString::to_string).collect();
        prop_assert_eq!(&rebuilt, &line);
        prop_assert_eq!(tokenize(&line), spans);
    }

    #[test]
    fn documents_round_trip(text in org_document_strategy()) {
        let doc = parse(&text);
        prop_assert_eq!(export(&doc), text);
    }

    #[test]
    fn every_heading_answers_flag_queries(text in org_document_strategy()) {
        let doc = parse(&text);
        for index in 0..doc.heading_count() {
            prop_assert!(query_inherited_flag(&doc, index, "nologrepeat").is_ok());
        }
        prop_assert!(query_inherited_flag(&doc, doc.heading_count(), "logdone").is_err());
    }
}
