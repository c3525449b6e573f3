//! Composite document builder.
//!
//! Layout of the generated page:
//!
//! ```text
//! <head>
//!   console instrumentation   (first, so later failures are captured)
//!   <style> styling buffer
//! <body>
//!   markup buffer
//!   <script> try { script buffer } catch → console.error
//! ```
//!
//! The instrumentation forwards `console.{log,info,warn,error}` and
//! uncaught errors to the host as `{ type: "console", method, args }`
//! with every argument already stringified.

use std::borrow::Cow;

use playpen_core::BufferSet;

const INSTRUMENTATION: &str = r#"(function () {
  var host = window.parent;
  var target = window.console;
  function stringify(value) {
    if (typeof value === 'string') return value;
    if (value instanceof Error) return value.name + ': ' + value.message;
    if (value !== null && typeof value === 'object') {
      try { return JSON.stringify(value); } catch (e) { /* cyclic */ }
    }
    return String(value);
  }
  function relay(method, args) {
    try {
      host.postMessage({
        type: 'console',
        method: method,
        args: Array.prototype.map.call(args, stringify)
      }, '*');
    } catch (e) { /* host gone */ }
  }
  ['log', 'info', 'warn', 'error'].forEach(function (method) {
    var original = target[method];
    target[method] = function () {
      if (original) original.apply(target, arguments);
      relay(method, arguments);
    };
  });
  window.onerror = function (message, source, line, column) {
    relay('error', ['Error: ' + message + ' (line ' + line + ', column ' + column + ')']);
    return true;
  };
  window.addEventListener('unhandledrejection', function (event) {
    relay('error', ['Unhandled rejection: ' + stringify(event.reason)]);
    event.preventDefault();
  });
})();"#;

const GUARD_OPEN: &str = "try {\n";
const GUARD_CLOSE: &str = "\n} catch (error) {\n  console.error(error && error.message ? error.message : String(error));\n}";

/// One runnable page built from the three buffers. Rebuilt per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeDocument {
    html: String,
    script: String,
}

impl CompositeDocument {
    pub fn build(buffers: &BufferSet) -> Self {
        let style = neutralize_closing_tag(&buffers.css, "style");
        let script = neutralize_closing_tag(&buffers.js, "script");

        let mut html = String::with_capacity(
            INSTRUMENTATION.len() + buffers.html.len() + style.len() + script.len() + 512,
        );
        html.push_str("<!DOCTYPE html>\n<html>\n<head>\n");
        html.push_str("<meta charset=\"utf-8\">\n");
        html.push_str(
            "<meta name=\"viewport\" content=\"width=device-width, initial-scale=1.0\">\n",
        );
        html.push_str("<script>\n");
        html.push_str(INSTRUMENTATION);
        html.push_str("\n</script>\n<style>\n");
        html.push_str(&style);
        html.push_str("\n</style>\n</head>\n<body>\n");
        html.push_str(&buffers.html);
        html.push_str("\n<script>\n");
        html.push_str(GUARD_OPEN);
        html.push_str(&script);
        html.push_str(GUARD_CLOSE);
        html.push_str("\n</script>\n</body>\n</html>\n");

        Self {
            html,
            script: buffers.js.clone(),
        }
    }

    /// The full page.
    pub fn as_str(&self) -> &str {
        &self.html
    }

    /// The raw script buffer, for contexts that evaluate script directly
    /// instead of rendering the page.
    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn into_string(self) -> String {
        self.html
    }
}

/// Rewrite `</tag` as `<\/tag` (ASCII case-insensitive) so buffer text
/// cannot close the element it is embedded in.
fn neutralize_closing_tag<'a>(source: &'a str, tag: &str) -> Cow<'a, str> {
    let bytes = source.as_bytes();
    let needle_len = 2 + tag.len();
    let mut out: Option<String> = None;
    let mut copied = 0;
    let mut i = 0;

    while i + needle_len <= bytes.len() {
        if bytes[i] == b'<'
            && bytes[i + 1] == b'/'
            && bytes[i + 2..i + needle_len].eq_ignore_ascii_case(tag.as_bytes())
        {
            let buf = out.get_or_insert_with(|| String::with_capacity(source.len() + 8));
            buf.push_str(&source[copied..=i]);
            buf.push('\\');
            copied = i + 1;
            i += needle_len;
        } else {
            i += 1;
        }
    }

    match out {
        Some(mut buf) => {
            buf.push_str(&source[copied..]);
            Cow::Owned(buf)
        }
        None => Cow::Borrowed(source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BufferSet {
        BufferSet::new("<p id=\"x\">x</p>", "p{color:red}", "console.log(1)")
    }

    #[test]
    fn test_buffers_land_in_their_slots() {
        let doc = CompositeDocument::build(&sample());
        let html = doc.as_str();

        assert!(html.contains("<style>\np{color:red}\n</style>"));
        let body = html.split("<body>").nth(1).unwrap();
        assert!(body.starts_with("\n<p id=\"x\">x</p>"));
        assert!(html.contains("try {\nconsole.log(1)\n} catch (error)"));
    }

    #[test]
    fn test_instrumentation_precedes_user_code() {
        let doc = CompositeDocument::build(&sample());
        let html = doc.as_str();
        let hook = html.find("window.onerror").unwrap();
        let style = html.find("<style>").unwrap();
        let user = html.find("console.log(1)").unwrap();
        assert!(hook < style);
        assert!(style < user);
    }

    #[test]
    fn test_instrumentation_uses_bridge_schema() {
        let html = CompositeDocument::build(&sample()).into_string();
        assert!(html.contains("type: 'console'"));
        for method in ["'log'", "'info'", "'warn'", "'error'"] {
            assert!(html.contains(method), "missing {method}");
        }
    }

    #[test]
    fn test_script_cannot_close_its_element() {
        let buffers = BufferSet::new("", "", "var s = '</SCRIPT><b>';");
        let doc = CompositeDocument::build(&buffers);
        assert!(doc.as_str().contains("var s = '<\\/SCRIPT><b>';"));
        assert_eq!(doc.script(), "var s = '</SCRIPT><b>';");
    }

    #[test]
    fn test_style_cannot_close_its_element() {
        let buffers = BufferSet::new("", "a{}</style><script>x()</script>", "");
        let html = CompositeDocument::build(&buffers).into_string();
        assert!(html.contains("a{}<\\/style><script>x()</script>"));
    }

    #[test]
    fn test_neutralize_borrows_when_clean() {
        assert!(matches!(
            neutralize_closing_tag("no tags here", "script"),
            Cow::Borrowed(_)
        ));
        assert_eq!(neutralize_closing_tag("</scrip", "script"), "</scrip");
    }

    #[test]
    fn test_rebuild_is_deterministic() {
        assert_eq!(
            CompositeDocument::build(&sample()),
            CompositeDocument::build(&sample())
        );
    }
}
