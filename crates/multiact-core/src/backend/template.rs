//! Snakefile template.
//!
//! Every string placed in the context is already a quoted Python literal, so
//! the template never escapes anything itself.

pub(crate) const SNAKEFILE_TEMPLATE_NAME: &str = "Snakefile";

pub(crate) const SNAKEFILE_TEMPLATE: &str = r#"# Generated by multiact from pipeline '{{ pipeline }}'. Do not edit.
# {{ containers|length }} container rules, {{ functions|length }} function rules, {{ shells|length }} shell rules, {{ markers|length }} marker rules.
import importlib
import json


def _multiact_call(target, input, output, kwargs):
    module_name, _, attr = target.rpartition(".")
    func = getattr(importlib.import_module(module_name), attr)
    return func(input, output, **kwargs)


rule all:
    input: [{{ targets|join(", ") }}]
{% macro io(rule) %}
    input:
{%- for input in rule.inputs %}
        {{ input.name }}=[{{ input.paths|join(", ") }}],
{%- endfor %}
        upstream=[{{ rule.upstream|join(", ") }}],
    output:
{%- for output in rule.outputs %}
        {{ output.name }}=[{{ output.paths|join(", ") }}],
{%- endfor %}
        marker=touch({{ rule.marker }}),
{%- endmacro %}
{% for rule in containers %}
rule {{ rule.name }}:{{ io(rule) }}
    container: {{ rule.image }}
    shell: {{ rule.shell }}
{% endfor %}
{%- for rule in functions %}
rule {{ rule.name }}:{{ io(rule) }}
    params:
        kwargs=json.loads({{ rule.params }}),
    run:
        _multiact_call({{ rule.function }}, input, output, params.kwargs)
{% endfor %}
{%- for rule in shells %}
rule {{ rule.name }}:{{ io(rule) }}
    shell: {{ rule.shell }}
{% endfor %}
{%- for rule in markers %}
# {{ rule.role }}
rule {{ rule.name }}:{{ io(rule) }}
    shell: "true"
{% endfor %}
"#;
