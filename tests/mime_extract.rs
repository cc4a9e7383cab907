use mailparse::parse_mail;

use mailpoll::mime::{extract_message, extract_text, ContentKind, ExtractOptions};

fn converting() -> ExtractOptions {
    ExtractOptions {
        convert_html: true,
        wrap_width: 80,
    }
}

fn raw_html() -> ExtractOptions {
    ExtractOptions {
        convert_html: false,
        wrap_width: 80,
    }
}

fn multipart(subtype: &str, parts: &[(&str, &str)]) -> String {
    let mut raw = format!("Content-Type: multipart/{subtype}; boundary=\"b\"\r\n\r\n");
    for (ctype, body) in parts {
        raw.push_str(&format!("--b\r\nContent-Type: {ctype}\r\n\r\n{body}\r\n"));
    }
    raw.push_str("--b--\r\n");
    raw
}

#[test]
fn single_plain_part_is_newline_prefixed() {
    let raw = "Content-Type: text/plain\r\n\r\nhello";
    let parsed = parse_mail(raw.as_bytes()).expect("parse_mail");
    assert_eq!(ContentKind::of(&parsed), ContentKind::PlainText);
    assert_eq!(extract_text(&parsed, &converting()), "\nhello");
}

#[test]
fn html_before_plain_is_converted_and_kept() {
    let raw = multipart(
        "alternative",
        &[("text/html", "<b>hi</b>"), ("text/plain", "hi2")],
    );
    let parsed = parse_mail(raw.as_bytes()).expect("parse_mail");
    assert_eq!(extract_text(&parsed, &converting()), "hi\n\nhi2");
}

#[test]
fn html_is_kept_as_markup_without_conversion() {
    let raw = multipart(
        "alternative",
        &[("text/html", "<b>hi</b>"), ("text/plain", "hi2")],
    );
    let parsed = parse_mail(raw.as_bytes()).expect("parse_mail");
    assert_eq!(extract_text(&parsed, &raw_html()), "<b>hi</b>\nhi2");
}

#[test]
fn first_plain_part_stops_the_level() {
    let raw = multipart("mixed", &[("text/plain", "A"), ("text/plain", "B")]);
    let parsed = parse_mail(raw.as_bytes()).expect("parse_mail");
    assert_eq!(extract_text(&parsed, &converting()), "\nA");
}

#[test]
fn plain_part_wins_over_later_html() {
    let raw = multipart(
        "alternative",
        &[("text/plain", "plain body"), ("text/html", "<p>html body</p>")],
    );
    let parsed = parse_mail(raw.as_bytes()).expect("parse_mail");
    assert_eq!(extract_text(&parsed, &converting()), "\nplain body");
}

#[test]
fn nested_multipart_stop_only_applies_to_its_own_level() {
    let raw = concat!(
        "Content-Type: multipart/mixed; boundary=\"outer\"\r\n",
        "\r\n",
        "--outer\r\n",
        "Content-Type: multipart/alternative; boundary=\"inner\"\r\n",
        "\r\n",
        "--inner\r\n",
        "Content-Type: text/html\r\n",
        "\r\n",
        "<p>X</p>\r\n",
        "--inner\r\n",
        "Content-Type: text/plain\r\n",
        "\r\n",
        "Y\r\n",
        "--inner--\r\n",
        "--outer\r\n",
        "Content-Type: text/plain\r\n",
        "\r\n",
        "Z\r\n",
        "--outer\r\n",
        "Content-Type: text/plain\r\n",
        "\r\n",
        "never\r\n",
        "--outer--\r\n",
    );
    let parsed = parse_mail(raw.as_bytes()).expect("parse_mail");
    assert_eq!(extract_text(&parsed, &converting()), "X\n\nY\nZ");
}

#[test]
fn attachments_inside_multipart_are_skipped() {
    let raw = concat!(
        "Content-Type: multipart/mixed; boundary=\"b\"\r\n",
        "\r\n",
        "--b\r\n",
        "Content-Type: application/pdf; name=\"file.pdf\"\r\n",
        "Content-Disposition: attachment; filename=\"file.pdf\"\r\n",
        "Content-Transfer-Encoding: base64\r\n",
        "\r\n",
        "SGVsbG8=\r\n",
        "--b\r\n",
        "Content-Type: text/plain; charset=utf-8\r\n",
        "\r\n",
        "Hello\r\n",
        "--b--\r\n",
    );
    let parsed = parse_mail(raw.as_bytes()).expect("parse_mail");
    assert_eq!(extract_text(&parsed, &converting()), "\nHello");
}

#[test]
fn unknown_top_level_kind_degrades_to_its_body() {
    let raw = "Content-Type: application/json\r\n\r\n{\"ok\":true}";
    let parsed = parse_mail(raw.as_bytes()).expect("parse_mail");
    assert_eq!(ContentKind::of(&parsed), ContentKind::Opaque);
    assert_eq!(extract_text(&parsed, &converting()), "\n{\"ok\":true}");
}

#[test]
fn quoted_printable_plain_text_is_decoded() {
    let raw = concat!(
        "Content-Type: text/plain; charset=utf-8\r\n",
        "Content-Transfer-Encoding: quoted-printable\r\n",
        "\r\n",
        "caf=C3=A9",
    );
    assert_eq!(extract_message(raw.as_bytes(), &converting()), "\ncafé");
}
