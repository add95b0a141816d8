//! Structural markers in compiler output and the hooks spliced into them.
//!
//! Every marker is data: a cheap probe proving the construct exists, a
//! stricter pattern capturing its exact shape, and the replacement
//! template (regex `${n}` syntax). Adding support for a new compiler
//! output shape means adding a row here.

use crate::core::CompilationMode;

use CompilationMode::{Debug, Optimize, Standard};

pub struct Marker {
    pub name: &'static str,
    pub modes: &'static [CompilationMode],
    /// A missing probe is a failure instead of a skip.
    pub required: bool,
    pub probe: &'static str,
    pub pattern: &'static str,
    pub template: &'static str,
}

const ALL_MODES: &[CompilationMode] = &[Debug, Standard, Optimize];

pub static MARKERS: &[Marker] = &[
    Marker {
        name: "iife",
        modes: ALL_MODES,
        required: true,
        probe: r"^\(function\(scope\)\{",
        pattern: r"^\(function\(scope\)\{\s*'use strict';",
        template: "(function(scope){\n'use strict';\nvar _ElmWatch_programType = null;",
    },
    Marker {
        name: "_Platform_initialize",
        modes: ALL_MODES,
        required: true,
        probe: r"(?m)^function _Platform_initialize\(",
        pattern: r"(?m)^function _Platform_initialize\((flagDecoder, args, init, update, subscriptions, stepperBuilder)\)\s*\{",
        template: "function _Platform_initialize(${1})\n\
{\n\
\tvar hot = globalThis.__ELM_WATCH.initialize(_ElmWatch_programType, { update: update, subscriptions: subscriptions });\n\
\tif (hot.swapped) { return hot.ports; }\n\
\thot.ports = _Platform_initialize_original(flagDecoder, args, init,\n\
\t\tF2(function(msg, model) { return A2(hot.current.update, msg, model); }),\n\
\t\tfunction(model) { return hot.current.subscriptions(model); },\n\
\t\tstepperBuilder);\n\
\treturn hot.ports;\n\
}\n\
\n\
function _Platform_initialize_original(${1})\n\
{",
    },
    Marker {
        name: "_Platform_worker",
        modes: ALL_MODES,
        required: false,
        probe: r"(?m)^var _Platform_worker\b",
        pattern: r"(?m)^var _Platform_worker = F4\(function\(impl, flagDecoder, debugMetadata, args\)\s*\{",
        template: "var _Platform_worker = F4(function(impl, flagDecoder, debugMetadata, args)\n{\n\t_ElmWatch_programType = \"Platform.worker\";",
    },
    Marker {
        name: "_Browser_element",
        modes: ALL_MODES,
        required: false,
        probe: r"(?m)^var _Browser_element\b",
        pattern: r"(?m)^var _Browser_element = (_Debugger_element \|\| )?F4\(function\(impl, flagDecoder, debugMetadata, args\)\s*\{",
        template: "var _Browser_element = ${1}F4(function(impl, flagDecoder, debugMetadata, args)\n{\n\t_ElmWatch_programType = \"Browser.element\";",
    },
    Marker {
        name: "_Browser_document",
        modes: ALL_MODES,
        required: false,
        probe: r"(?m)^var _Browser_document\b",
        pattern: r"(?m)^var _Browser_document = (_Debugger_document \|\| )?F4\(function\(impl, flagDecoder, debugMetadata, args\)\s*\{",
        template: "var _Browser_document = ${1}F4(function(impl, flagDecoder, debugMetadata, args)\n{\n\t_ElmWatch_programType = \"Browser.document\";",
    },
    Marker {
        name: "_Browser_application",
        modes: ALL_MODES,
        required: false,
        probe: r"(?m)^function _Browser_application\(",
        pattern: r"(?m)^function _Browser_application\(impl\)\s*\{\s*var onUrlChange = impl\.(\w+);",
        template: "function _Browser_application(impl)\n{\n\t_ElmWatch_programType = \"Browser.application\";\n\tvar onUrlChange = impl.${1};",
    },
    Marker {
        name: "_Debugger_element",
        modes: &[Debug],
        required: false,
        probe: r"(?m)^var _Debugger_element\b",
        pattern: r"(?m)^var _Debugger_element = F4\(function\(impl, flagDecoder, debugMetadata, args\)\s*\{",
        template: "var _Debugger_element = F4(function(impl, flagDecoder, debugMetadata, args)\n{\n\t_ElmWatch_programType = \"Browser.element\";",
    },
    Marker {
        name: "_Debugger_document",
        modes: &[Debug],
        required: false,
        probe: r"(?m)^var _Debugger_document\b",
        pattern: r"(?m)^var _Debugger_document = F4\(function\(impl, flagDecoder, debugMetadata, args\)\s*\{",
        template: "var _Debugger_document = F4(function(impl, flagDecoder, debugMetadata, args)\n{\n\t_ElmWatch_programType = \"Browser.document\";",
    },
    Marker {
        name: "_Platform_export",
        modes: ALL_MODES,
        required: true,
        probe: r"(?m)^function _Platform_export\(",
        pattern: r"(?m)^function _Platform_export\(exports\)\s*\{",
        template: "function _Platform_export(exports)\n{\n\tif (globalThis.__ELM_WATCH.register(scope, exports)) { return; }",
    },
];
