use hdorch::diagnostics::{ErrorEvent, LadderError};
use hdorch::event_bus::Event;
use hdorch::hierarchy::Level;
use hdorch::telemetry::{CONTEXT_COLOR, FormatterMode, LINE_COLOR, PlainFormatter, RESET_COLOR, TelemetryFormatter};
use serde_json::json;

#[test]
fn render_event_includes_colors_and_scope_context() {
    let fmt = PlainFormatter::with_mode(FormatterMode::Colored);
    let ev = Event::diagnostic("caller", "retrying after 429");
    let render = fmt.render_event(&ev);
    assert_eq!(render.context.as_deref(), Some("caller"));
    let joined = render.join_lines();
    assert!(joined.contains(LINE_COLOR));
    assert!(joined.contains(RESET_COLOR));
    assert!(joined.contains("retrying after 429"));
}

#[test]
fn render_errors_formats_scope_lines_and_details() {
    let fmt = PlainFormatter::with_mode(FormatterMode::Colored);

    let e1 = ErrorEvent::analyzer(
        "feature-decomposer",
        Level::Feature,
        LadderError::msg("boom").with_cause(LadderError::msg("inner")),
    )
    .with_tag("t1")
    .with_context(json!({"k": 1}));

    let e2 = ErrorEvent::coordinator(LadderError::msg("oops"));

    let renders = fmt.render_errors(&[e1.clone(), e2.clone()]);
    assert_eq!(renders.len(), 2);

    let r0 = renders[0].clone();
    let head = r0.lines[0].clone();
    assert!(head.contains(CONTEXT_COLOR));
    assert!(head.contains(RESET_COLOR));
    let body = r0.lines.join("");
    assert!(body.contains("error: boom"));
    assert!(body.contains("cause: inner"));
    assert!(body.contains("tags: [\"t1\"]"));
    assert!(body.contains("context: {\"k\":1}"));
    assert!(r0.context.unwrap().contains("Analyzer"));

    let r1 = renders[1].clone();
    let hdr = r1.lines[0].clone();
    assert!(hdr.contains("Coordinator"));
    let body1 = r1.lines.join("");
    assert!(body1.contains("error: oops"));
    assert!(!body1.contains("cause:"));
    assert!(!body1.contains("tags:"));
    assert!(!body1.contains("context:"));
}

#[test]
fn formatter_mode_colored_includes_ansi_codes() {
    let fmt = PlainFormatter::with_mode(FormatterMode::Colored);
    let ev = Event::diagnostic("TestScope", "test message");
    let render = fmt.render_event(&ev);
    let output = render.join_lines();

    assert!(
        output.contains(LINE_COLOR),
        "Colored mode should include LINE_COLOR"
    );
    assert!(
        output.contains(RESET_COLOR),
        "Colored mode should include RESET_COLOR"
    );
}

#[test]
fn formatter_mode_plain_excludes_ansi_codes() {
    let fmt = PlainFormatter::with_mode(FormatterMode::Plain);
    let ev = Event::diagnostic("TestScope", "test message");
    let render = fmt.render_event(&ev);
    let output = render.join_lines();

    assert!(
        !output.contains('\x1b'),
        "Plain mode should not include any ANSI escape codes"
    );
    assert!(
        output.contains("test message"),
        "Plain mode should still include the message"
    );
}

#[test]
fn formatter_mode_colored_errors_include_colors() {
    let fmt = PlainFormatter::with_mode(FormatterMode::Colored);
    let events = vec![
        ErrorEvent::gate(Level::Story, LadderError::msg("confidence too low"))
            .with_tag("validation")
            .with_context(json!({"line": 42})),
    ];
    let renders = fmt.render_errors(&events);
    let output = renders[0].join_lines();

    assert!(output.contains(CONTEXT_COLOR), "Should color the scope");
    assert!(
        output.contains(LINE_COLOR),
        "Should color the error details"
    );
    assert!(output.contains(RESET_COLOR), "Should include reset codes");
}

#[test]
fn formatter_mode_plain_errors_exclude_colors() {
    let fmt = PlainFormatter::with_mode(FormatterMode::Plain);
    let events = vec![
        ErrorEvent::gate(Level::Story, LadderError::msg("confidence too low"))
            .with_tag("validation")
            .with_context(json!({"line": 42})),
    ];
    let renders = fmt.render_errors(&events);
    let output = renders[0].join_lines();

    assert!(
        !output.contains('\x1b'),
        "Plain mode should not include ANSI codes"
    );
    assert!(
        output.contains("confidence too low"),
        "Should include error message"
    );
    assert!(output.contains("validation"), "Should include tags");
    assert!(output.contains("line"), "Should include context");
}

#[test]
fn formatter_mode_plain_nested_errors_exclude_colors() {
    let fmt = PlainFormatter::with_mode(FormatterMode::Plain);
    let nested_error = LadderError::msg("root error")
        .with_cause(LadderError::msg("first cause").with_cause(LadderError::msg("second cause")));

    let events = vec![ErrorEvent::writer(3, nested_error)];
    let renders = fmt.render_errors(&events);
    let output = renders[0].join_lines();

    assert!(
        !output.contains('\x1b'),
        "Plain mode should not include ANSI codes in nested errors"
    );
    assert!(output.contains("root error"), "Should include root error");
    assert!(output.contains("first cause"), "Should include first cause");
    assert!(
        output.contains("second cause"),
        "Should include second cause"
    );
}

#[test]
fn formatter_mode_auto_default() {
    let mode = FormatterMode::default();
    assert_eq!(mode, FormatterMode::Auto);

    let fmt = PlainFormatter::default();
    let default_fmt = PlainFormatter::default();

    let ev = Event::diagnostic("scope", "msg");
    let render1 = fmt.render_event(&ev);
    let render2 = default_fmt.render_event(&ev);
    assert_eq!(render1.join_lines(), render2.join_lines());
}
